//! Channel filter matching
//!
//! A filter is a set of property predicates; a channel satisfies it when
//! every named property is present with a matching value. Properties the
//! filter does not name are wildcards.

use super::types::{Properties, PropertyValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One predicate set, e.g. "text channels to a contact"
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelFilter {
    predicates: BTreeMap<String, PropertyValue>,
}

impl ChannelFilter {
    /// A filter with no predicates, which matches every channel
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        Self {
            predicates: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Add or replace a predicate
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.predicates.insert(name.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn matches(&self, channel: &Properties) -> bool {
        filter_matches(self, channel)
    }
}

impl From<Properties> for ChannelFilter {
    fn from(predicates: Properties) -> Self {
        Self { predicates }
    }
}

/// True when every predicate of `filter` holds for `channel`
pub fn filter_matches(filter: &ChannelFilter, channel: &Properties) -> bool {
    filter.predicates.iter().all(|(name, wanted)| {
        channel
            .get(name)
            .map(|actual| actual.satisfies(wanted))
            .unwrap_or(false)
    })
}

/// True when any filter in the list matches; an empty list matches nothing
pub fn matches_any(filters: &[ChannelFilter], channel: &Properties) -> bool {
    filters.iter().any(|f| filter_matches(f, channel))
}
