//! Domain Value Objects
//!
//! Keys, partitions and hints shared by every layer of the cache.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Interned identifier of a value key (63-bit, non-negative).
pub type Identifier = i64;

/// Bound for structured value keys.
///
/// The cache never looks inside a key; it only hashes, compares and
/// serializes it (serialization lets keys cross the remote protocol and be
/// persisted by the persistent identifier map).
pub trait ValueKey:
    Eq + Hash + Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> ValueKey for T where
    T: Eq + Hash + Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

// =============================================================================
// Cache Key
// =============================================================================

/// Namespace of one cache instance: one configuration within one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    run_id: String,
    configuration: String,
}

impl CacheKey {
    pub fn new(run_id: impl Into<String>, configuration: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            configuration: configuration.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    /// Name of the store holding one partition of this cache.
    ///
    /// Both parts are percent-encoded, so distinct keys never share a store
    /// even when their parts contain `/`.
    pub fn store_name(&self, partition: Partition) -> String {
        format!(
            "{}/{}/{}",
            urlencoding::encode(&self.run_id),
            urlencoding::encode(&self.configuration),
            partition
        )
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.configuration)
    }
}

// =============================================================================
// Partition
// =============================================================================

/// Visibility class of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// Reusable by any reader of the cache, including other processes
    Shared,
    /// Visible only to the process/configuration that wrote it
    Private,
}

impl Partition {
    pub fn name(&self) -> &'static str {
        match self {
            Partition::Shared => "shared",
            Partition::Private => "private",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Cache Select Hint
// =============================================================================

/// Per-batch classification of keys into partitions.
///
/// Callers that already know where their values live pass one of these
/// alongside a batch so the cache does not probe both partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheSelectHint<K: Eq + Hash> {
    AllShared,
    AllPrivate,
    /// The listed keys are private, everything else is shared
    PrivateValues(Arc<HashSet<K>>),
    /// The listed keys are shared, everything else is private
    SharedValues(Arc<HashSet<K>>),
}

impl<K: Eq + Hash> CacheSelectHint<K> {
    pub fn all_shared() -> Self {
        CacheSelectHint::AllShared
    }

    pub fn all_private() -> Self {
        CacheSelectHint::AllPrivate
    }

    pub fn private_values(keys: impl IntoIterator<Item = K>) -> Self {
        CacheSelectHint::PrivateValues(Arc::new(keys.into_iter().collect()))
    }

    pub fn shared_values(keys: impl IntoIterator<Item = K>) -> Self {
        CacheSelectHint::SharedValues(Arc::new(keys.into_iter().collect()))
    }

    /// Partition a key belongs to under this hint.
    pub fn partition_of(&self, key: &K) -> Partition {
        match self {
            CacheSelectHint::AllShared => Partition::Shared,
            CacheSelectHint::AllPrivate => Partition::Private,
            CacheSelectHint::PrivateValues(keys) if keys.contains(key) => Partition::Private,
            CacheSelectHint::PrivateValues(_) => Partition::Shared,
            CacheSelectHint::SharedValues(keys) if keys.contains(key) => Partition::Shared,
            CacheSelectHint::SharedValues(_) => Partition::Private,
        }
    }

    pub fn is_private(&self, key: &K) -> bool {
        self.partition_of(key) == Partition::Private
    }
}

// =============================================================================
// Computed Value
// =============================================================================

/// A value together with the key it was computed for.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedValue<K, V> {
    pub specification: K,
    pub value: Arc<V>,
}

impl<K, V> ComputedValue<K, V> {
    pub fn new(specification: K, value: V) -> Self {
        Self {
            specification,
            value: Arc::new(value),
        }
    }

    pub fn shared(specification: K, value: Arc<V>) -> Self {
        Self {
            specification,
            value,
        }
    }
}

// =============================================================================
// Value Specification
// =============================================================================

/// Reference value key: a named value on a computation target, qualified by
/// properties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpecification {
    pub value_name: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl ValueSpecification {
    pub fn new(value_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            value_name: value_name.into(),
            target: target.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)?;
        if !self.properties.is_empty() {
            let props: Vec<String> = self
                .properties
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{{{}}}", props.join(","))?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_store_names() {
        let key = CacheKey::new("cycle-1", "ConfigA");
        assert_eq!(key.to_string(), "cycle-1/ConfigA");
        assert_eq!(key.store_name(Partition::Shared), "cycle-1/ConfigA/shared");
        assert_eq!(key.store_name(Partition::Private), "cycle-1/ConfigA/private");
    }

    #[test]
    fn test_slashes_do_not_merge_store_names() {
        let a = CacheKey::new("run/x", "cfg");
        let b = CacheKey::new("run", "x/cfg");
        assert_ne!(a.store_name(Partition::Shared), b.store_name(Partition::Shared));
        assert_eq!(a.store_name(Partition::Shared), "run%2Fx/cfg/shared");

        // A literal escape sequence stays distinct from the slash it encodes
        let c = CacheKey::new("run%2Fx", "cfg");
        assert_ne!(a.store_name(Partition::Shared), c.store_name(Partition::Shared));
    }

    #[test]
    fn test_hint_partitions() {
        let a = ValueSpecification::new("PV", "A");
        let b = ValueSpecification::new("PV", "B");

        assert_eq!(
            CacheSelectHint::<ValueSpecification>::all_shared().partition_of(&a),
            Partition::Shared
        );
        assert!(CacheSelectHint::<ValueSpecification>::all_private().is_private(&a));

        let private = CacheSelectHint::private_values([a.clone()]);
        assert!(private.is_private(&a));
        assert!(!private.is_private(&b));

        let shared = CacheSelectHint::shared_values([a.clone()]);
        assert!(!shared.is_private(&a));
        assert!(shared.is_private(&b));
    }

    #[test]
    fn test_value_specification_display() {
        let spec = ValueSpecification::new("Present Value", "Trade~1")
            .with_property("Currency", "USD")
            .with_property("Function", "pv");
        assert_eq!(
            spec.to_string(),
            "Present Value[Trade~1]{Currency=USD,Function=pv}"
        );
    }

    #[test]
    fn test_value_specification_equality_includes_properties() {
        let plain = ValueSpecification::new("PV", "T");
        let qualified = ValueSpecification::new("PV", "T").with_property("Currency", "USD");
        assert_ne!(plain, qualified);
        assert_eq!(qualified.clone(), qualified);
    }
}
