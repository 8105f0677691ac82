use std::collections::HashMap;

use crate::config::StatsMapEntry;
use crate::model::{MappingRule, SeriesId};

/// Lookup table from series id to destination measurement and tags, fixed
/// for the duration of a run.
#[derive(Debug, Clone, Default)]
pub struct MappingResolver {
    rules: HashMap<SeriesId, MappingRule>,
}

impl MappingResolver {
    pub fn new(rules: impl IntoIterator<Item = MappingRule>) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub fn from_stats_map(stats_map: &HashMap<String, StatsMapEntry>) -> Self {
        Self::new(stats_map.iter().map(|(id, entry)| MappingRule {
            id: SeriesId::new(id.as_str()),
            measurement: entry.measurement.clone(),
            tags: entry.tags.clone(),
        }))
    }

    pub fn resolve(&self, id: &SeriesId) -> Option<&MappingRule> {
        self.rules.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &SeriesId> {
        self.rules.keys()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
