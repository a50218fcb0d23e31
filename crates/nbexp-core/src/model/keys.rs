//! Metric keys and values.
//!
//! Keys are plain structs compared field by field. They are used directly as
//! map keys and expose their labels as an ordered list, so a label value that
//! contains a separator character can never corrupt a lookup.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

/// Discriminator of one labeled series.
pub trait MetricKey: Clone + Eq + Ord + Hash + fmt::Debug + Send + Sync {
    /// Label names, in exposition order.
    const LABEL_NAMES: &'static [&'static str];

    /// Label values, in the same order as [`MetricKey::LABEL_NAMES`].
    fn label_values(&self) -> Vec<&str>;

    /// `(name, value)` pairs in exposition order.
    fn labels(&self) -> Vec<(&'static str, &str)> {
        Self::LABEL_NAMES
            .iter()
            .copied()
            .zip(self.label_values())
            .collect()
    }
}

/// Which capacity figure a storage value reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeClass {
    Free,
    Used,
}

impl SizeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeClass::Free => "free",
            SizeClass::Used => "used",
        }
    }
}

/// Storage unit capacity series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey {
    pub name: String,
    pub storage_type: String,
    pub size: SizeClass,
}

impl StorageKey {
    pub fn new(name: impl Into<String>, storage_type: impl Into<String>, size: SizeClass) -> Self {
        Self {
            name: name.into(),
            storage_type: storage_type.into(),
            size,
        }
    }
}

impl MetricKey for StorageKey {
    const LABEL_NAMES: &'static [&'static str] = &["name", "type", "size"];

    fn label_values(&self) -> Vec<&str> {
        vec![self.name.as_str(), self.storage_type.as_str(), self.size.as_str()]
    }
}

/// Job count / transferred bytes series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    pub action: String,
    pub policy_type: String,
    pub status: String,
}

impl JobKey {
    pub fn new(
        action: impl Into<String>,
        policy_type: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            policy_type: policy_type.into(),
            status: status.into(),
        }
    }
}

impl MetricKey for JobKey {
    const LABEL_NAMES: &'static [&'static str] = &["action", "policy_type", "status"];

    fn label_values(&self) -> Vec<&str> {
        vec![
            self.action.as_str(),
            self.policy_type.as_str(),
            self.status.as_str(),
        ]
    }
}

/// Job exit status series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobStatusKey {
    pub action: String,
    pub status: String,
}

impl JobStatusKey {
    pub fn new(action: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: status.into(),
        }
    }
}

impl MetricKey for JobStatusKey {
    const LABEL_NAMES: &'static [&'static str] = &["action", "status"];

    fn label_values(&self) -> Vec<&str> {
        vec![self.action.as_str(), self.status.as_str()]
    }
}

/// One sample: a key and its numeric value.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricValue<K: MetricKey> {
    pub key: K,
    pub value: f64,
}

impl<K: MetricKey> MetricValue<K> {
    pub fn new(key: K, value: f64) -> Self {
        Self { key, value }
    }
}

/// Accumulator folding samples into per-key totals.
///
/// Iteration order is the key order, so output is deterministic.
#[derive(Debug, Clone)]
pub struct Buckets<K: MetricKey> {
    map: BTreeMap<K, f64>,
}

impl<K: MetricKey> Default for Buckets<K> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }
}

impl<K: MetricKey> Buckets<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: K, value: f64) {
        *self.map.entry(key).or_insert(0.0) += value;
    }

    pub fn increment(&mut self, key: K) {
        self.add(key, 1.0);
    }

    pub fn get(&self, key: &K) -> Option<f64> {
        self.map.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn into_values(self) -> Vec<MetricValue<K>> {
        self.map
            .into_iter()
            .map(|(key, value)| MetricValue { key, value })
            .collect()
    }
}
