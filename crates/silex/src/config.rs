//! Typed, lazily parsed configuration.
//!
//! Options are stored as strings and parsed at fetch time; `SILEX_<NAME>`
//! environment variables override registered values, so a run can be
//! reconfigured without touching the embedder.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

/// Well-known option names.
pub mod options {
    /// Which backend executes guest code: `interp` (reference, default) or
    /// `jit` (host machine backend with interpreter fallback).
    pub const CORE: &str = "Core";
    /// Emit TSO-ordered memory accesses (default on).
    pub const TSO_ENABLED: &str = "TSOEnabled";
    /// Force full fences on every guest access.
    pub const PARANOID_TSO: &str = "ParanoidTSO";
    /// Multi-block translation (default on).
    pub const MULTIBLOCK: &str = "Multiblock";
    /// Instruction budget per translated region.
    pub const MAX_INST: &str = "MaxInst";
    /// Emit self-modifying-code guards at region entries (default on).
    pub const SMC_CHECKS: &str = "SMCChecks";
}

pub struct Config {
    values: Mutex<HashMap<String, String>>,
}

impl Config {
    pub fn new() -> Config {
        Config { values: Mutex::new(HashMap::new()) }
    }

    pub fn set(&self, name: &str, value: impl Into<String>) {
        self.values.lock().unwrap().insert(name.to_string(), value.into());
    }

    /// Fetch and parse an option. Environment overrides win over registered
    /// values; parse failures fall back to the default with a warning.
    pub fn get_or<T: FromStr>(&self, name: &str, default: T) -> T {
        let raw = std::env::var(format!("SILEX_{}", name.to_uppercase()))
            .ok()
            .or_else(|| self.values.lock().unwrap().get(name).cloned());
        match raw {
            Some(text) => text.parse().unwrap_or_else(|_| {
                log::warn!("config option {name} has unparseable value {text:?}");
                default
            }),
            None => default,
        }
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        let raw = std::env::var(format!("SILEX_{}", name.to_uppercase()))
            .ok()
            .or_else(|| self.values.lock().unwrap().get(name).cloned());
        match raw.as_deref() {
            Some("1") | Some("true") | Some("on") | Some("yes") => true,
            Some("0") | Some("false") | Some("off") | Some("no") => false,
            Some(other) => {
                log::warn!("config option {name} has unparseable value {other:?}");
                default
            }
            None => default,
        }
    }

    pub fn get_string(&self, name: &str, default: &str) -> String {
        std::env::var(format!("SILEX_{}", name.to_uppercase()))
            .ok()
            .or_else(|| self.values.lock().unwrap().get(name).cloned())
            .unwrap_or_else(|| default.to_string())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_fetch_parses_lazily() {
        let config = Config::new();
        config.set(options::MAX_INST, "123");
        assert_eq!(config.get_or(options::MAX_INST, 5000usize), 123);
        assert_eq!(config.get_or("Missing", 7u32), 7);
    }

    #[test]
    fn bool_spellings() {
        let config = Config::new();
        config.set("A", "on");
        config.set("B", "0");
        config.set("C", "maybe");
        assert!(config.get_bool("A", false));
        assert!(!config.get_bool("B", true));
        assert!(config.get_bool("C", true));
    }

    #[test]
    fn env_override_wins() {
        let config = Config::new();
        config.set("OverrideProbe", "1");
        std::env::set_var("SILEX_OVERRIDEPROBE", "2");
        assert_eq!(config.get_or("OverrideProbe", 0u32), 2);
        std::env::remove_var("SILEX_OVERRIDEPROBE");
    }
}
