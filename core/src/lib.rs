pub mod config;
pub mod decoder;
pub mod errors;
pub mod ingestor;
pub mod mapping;
pub mod model;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod writer;

pub use config::{ImportConfig, load_config};
pub use errors::{ImportError, Result};
pub use ingestor::{Importer, RunAborted};
pub use mapping::MappingResolver;
pub use model::{RunSummary, SeriesDescriptor, SeriesId};
