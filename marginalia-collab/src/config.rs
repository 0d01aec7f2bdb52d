//! Engine configuration.
//!
//! [`EngineConfig`] aggregates the per-component configs and can overlay
//! `MARGINALIA_*` environment variables on the defaults:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `MARGINALIA_DATA_DIR` | `store.path` |
//! | `MARGINALIA_DEBOUNCE_MS` | `persistence.debounce` |
//! | `MARGINALIA_IDLE_TIMEOUT_SECS` | `persistence.idle_timeout` |
//! | `MARGINALIA_PRESENCE_TIMEOUT_SECS` | `presence.idle_timeout` |
//! | `MARGINALIA_COLLAPSE_THRESHOLD` | `resolver.collapse_threshold` |
//! | `MARGINALIA_SYNC_WRITES` | `store.sync_writes` |

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use marginalia_core::{RegionResolver, ResolverConfig};

use crate::persistence::{PersistenceConfig, PersistenceManager};
use crate::presence::PresenceConfig;
use crate::registry::DocumentRegistry;
use crate::storage::{DocumentStore, StoreConfig, StoreError};

pub const ENV_DATA_DIR: &str = "MARGINALIA_DATA_DIR";
pub const ENV_DEBOUNCE_MS: &str = "MARGINALIA_DEBOUNCE_MS";
pub const ENV_IDLE_TIMEOUT_SECS: &str = "MARGINALIA_IDLE_TIMEOUT_SECS";
pub const ENV_PRESENCE_TIMEOUT_SECS: &str = "MARGINALIA_PRESENCE_TIMEOUT_SECS";
pub const ENV_COLLAPSE_THRESHOLD: &str = "MARGINALIA_COLLAPSE_THRESHOLD";
pub const ENV_SYNC_WRITES: &str = "MARGINALIA_SYNC_WRITES";

/// Configuration for a whole engine instance.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub persistence: PersistenceConfig,
    pub presence: PresenceConfig,
    pub resolver: ResolverConfig,
}

impl EngineConfig {
    /// Short timings and a store under `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig::for_testing(path),
            persistence: PersistenceConfig::for_testing(),
            presence: PresenceConfig::default(),
            resolver: ResolverConfig::default(),
        }
    }

    /// Defaults overlaid with `MARGINALIA_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`. Values that do not parse
    /// are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|dir| !dir.trim().is_empty()) {
            config.store.path = PathBuf::from(dir);
        }
        if let Some(ms) = parse::<u64>(&lookup, ENV_DEBOUNCE_MS) {
            config.persistence.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_IDLE_TIMEOUT_SECS) {
            config.persistence.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, ENV_PRESENCE_TIMEOUT_SECS) {
            config.presence.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) = parse::<usize>(&lookup, ENV_COLLAPSE_THRESHOLD) {
            config.resolver.collapse_threshold = threshold;
        }
        if let Some(sync) = lookup(ENV_SYNC_WRITES) {
            match parse_bool(&sync) {
                Some(sync) => config.store.sync_writes = sync,
                None => log::warn!("Ignoring {}={:?}: expected a boolean", ENV_SYNC_WRITES, sync),
            }
        }

        config
    }

    pub fn resolver(&self) -> RegionResolver {
        RegionResolver::new(self.resolver)
    }

    /// Open the RocksDB store and wire a registry and persistence manager
    /// around it.
    pub fn open_persistence(&self) -> Result<PersistenceManager, StoreError> {
        let backend = Arc::new(DocumentStore::open(self.store.clone())?);
        let registry = Arc::new(DocumentRegistry::with_presence_config(backend, self.presence));
        Ok(PersistenceManager::new(registry, self.persistence.clone()))
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = EngineConfig::from_lookup(|_| None);
        assert_eq!(config.store.path, PathBuf::from("marginalia_data"));
        assert_eq!(config.persistence.debounce, Duration::from_secs(2));
        assert_eq!(config.resolver.collapse_threshold, 3);
        assert!(!config.store.sync_writes);
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_DATA_DIR, "/var/lib/marginalia"),
            (ENV_DEBOUNCE_MS, "250"),
            (ENV_IDLE_TIMEOUT_SECS, "90"),
            (ENV_PRESENCE_TIMEOUT_SECS, "12"),
            (ENV_COLLAPSE_THRESHOLD, "4"),
            (ENV_SYNC_WRITES, "yes"),
        ]));

        assert_eq!(config.store.path, PathBuf::from("/var/lib/marginalia"));
        assert_eq!(config.persistence.debounce, Duration::from_millis(250));
        assert_eq!(config.persistence.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.presence.idle_timeout, Duration::from_secs(12));
        assert_eq!(config.resolver.collapse_threshold, 4);
        assert!(config.store.sync_writes);
    }

    #[test]
    fn test_invalid_values_ignored() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_DEBOUNCE_MS, "soon"),
            (ENV_COLLAPSE_THRESHOLD, "-1"),
            (ENV_SYNC_WRITES, "maybe"),
            (ENV_DATA_DIR, "  "),
        ]));
        let defaults = EngineConfig::default();

        assert_eq!(config.persistence.debounce, defaults.persistence.debounce);
        assert_eq!(config.resolver.collapse_threshold, defaults.resolver.collapse_threshold);
        assert_eq!(config.store.sync_writes, defaults.store.sync_writes);
        assert_eq!(config.store.path, defaults.store.path);
    }

    #[test]
    fn test_open_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::for_testing(dir.path());
        let manager = config.open_persistence().unwrap();
        assert!(manager.registry().is_empty());
        assert_eq!(config.resolver().config().collapse_threshold, 3);
    }
}
