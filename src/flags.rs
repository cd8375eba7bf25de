//! Process-wide feature-flag registry (C1).
//!
//! Four independent booleans gate enforcement, mutex protection, persistence,
//! and the guarded-stop-loss policy. Reads are lock-free atomics; writes are
//! infrequent and go through `Apply`. A `FeatureFlags` value is constructed
//! once at startup and passed by `Arc` to every other component — there is
//! no process-global singleton.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Canonical legacy alias table (§4.1.1). New code must only ever emit the
/// canonical names on the left of `FlagUpdate`; these are accepted on input
/// only, for env overrides and for callers still on the old names.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("ENABLE_RISK_LIMITS", "enableRiskEnforcement"),
    ("RISK_LIMITS_ENABLED", "enableRiskEnforcement"),
    ("ENABLE_LOCKING", "enableMutexProtection"),
    ("USE_MUTEX", "enableMutexProtection"),
    ("ENABLE_DB_PERSIST", "enablePersistence"),
    ("PERSIST_TO_DB", "enablePersistence"),
    ("ENABLE_SL_GUARD", "enableGuardedStopLoss"),
    ("GUARDED_STOP_LOSS", "enableGuardedStopLoss"),
];

fn canonical_name(key: &str) -> Option<&'static str> {
    match key {
        "enableRiskEnforcement" => Some("enableRiskEnforcement"),
        "enableMutexProtection" => Some("enableMutexProtection"),
        "enablePersistence" => Some("enablePersistence"),
        "enableGuardedStopLoss" => Some("enableGuardedStopLoss"),
        other => LEGACY_ALIASES
            .iter()
            .find(|(alias, _)| *alias == other)
            .map(|(_, canon)| *canon),
    }
}

/// A consistent read of the four flags at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureFlagState {
    pub enable_guarded_stop_loss: bool,
    pub enable_mutex_protection: bool,
    pub enable_persistence: bool,
    pub enable_risk_enforcement: bool,
}

/// Partial update: unset fields leave the corresponding flag untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagUpdate {
    pub enable_guarded_stop_loss: Option<bool>,
    pub enable_mutex_protection: Option<bool>,
    pub enable_persistence: Option<bool>,
    pub enable_risk_enforcement: Option<bool>,
}

pub struct FeatureFlags {
    guarded_stop_loss: AtomicBool,
    mutex_protection: AtomicBool,
    persistence: AtomicBool,
    risk_enforcement: AtomicBool,
    warned_aliases: Mutex<HashSet<&'static str>>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::new(FeatureFlagState::default())
    }
}

impl FeatureFlags {
    pub fn new(initial: FeatureFlagState) -> Self {
        Self {
            guarded_stop_loss: AtomicBool::new(initial.enable_guarded_stop_loss),
            mutex_protection: AtomicBool::new(initial.enable_mutex_protection),
            persistence: AtomicBool::new(initial.enable_persistence),
            risk_enforcement: AtomicBool::new(initial.enable_risk_enforcement),
            warned_aliases: Mutex::new(HashSet::new()),
        }
    }

    /// Loads initial state from the environment, using §4.1.1's alias table
    /// for both canonical and legacy variable names. An unparseable boolean
    /// literal is logged and ignored rather than treated as fatal.
    pub fn from_env() -> Self {
        let flags = Self::default();
        for key in env_keys() {
            let Some(canonical) = canonical_name(key) else {
                continue;
            };
            if let Ok(raw) = std::env::var(key) {
                match parse_bool(&raw) {
                    Some(value) => flags.set_canonical(canonical, value, key),
                    None => {
                        tracing::warn!(
                            key,
                            raw,
                            "ignoring unparseable boolean literal for feature flag"
                        );
                    }
                }
            }
        }
        flags
    }

    /// Consistent read of all four flags.
    pub fn snapshot(&self) -> FeatureFlagState {
        FeatureFlagState {
            enable_guarded_stop_loss: self.guarded_stop_loss.load(Ordering::Acquire),
            enable_mutex_protection: self.mutex_protection.load(Ordering::Acquire),
            enable_persistence: self.persistence.load(Ordering::Acquire),
            enable_risk_enforcement: self.risk_enforcement.load(Ordering::Acquire),
        }
    }

    /// Applies a partial update; unset fields are left untouched. Returns
    /// the resulting state.
    pub fn apply(&self, update: FlagUpdate) -> FeatureFlagState {
        if let Some(v) = update.enable_guarded_stop_loss {
            self.guarded_stop_loss.store(v, Ordering::Release);
        }
        if let Some(v) = update.enable_mutex_protection {
            self.mutex_protection.store(v, Ordering::Release);
        }
        if let Some(v) = update.enable_persistence {
            self.persistence.store(v, Ordering::Release);
        }
        if let Some(v) = update.enable_risk_enforcement {
            self.risk_enforcement.store(v, Ordering::Release);
        }
        self.snapshot()
    }

    pub fn enable_risk_enforcement(&self) -> bool {
        self.risk_enforcement.load(Ordering::Acquire)
    }

    pub fn enable_mutex_protection(&self) -> bool {
        self.mutex_protection.load(Ordering::Acquire)
    }

    pub fn enable_persistence(&self) -> bool {
        self.persistence.load(Ordering::Acquire)
    }

    pub fn enable_guarded_stop_loss(&self) -> bool {
        self.guarded_stop_loss.load(Ordering::Acquire)
    }

    fn set_canonical(&self, canonical: &'static str, value: bool, observed_key: &'static str) {
        if observed_key != canonical {
            self.warn_legacy_once(observed_key);
        }
        match canonical {
            "enableRiskEnforcement" => self.risk_enforcement.store(value, Ordering::Release),
            "enableMutexProtection" => self.mutex_protection.store(value, Ordering::Release),
            "enablePersistence" => self.persistence.store(value, Ordering::Release),
            "enableGuardedStopLoss" => self.guarded_stop_loss.store(value, Ordering::Release),
            _ => unreachable!("canonical_name only returns known names"),
        }
    }

    fn warn_legacy_once(&self, legacy_key: &'static str) {
        let mut warned = self.warned_aliases.lock().unwrap_or_else(|e| e.into_inner());
        if warned.insert(legacy_key) {
            tracing::warn!(
                legacy_key,
                "feature flag read via deprecated alias; migrate to the canonical name"
            );
        }
    }
}

/// Safe to call on a null/absent registry: reads are false, writes no-op.
/// In Rust this is modeled as `Option<&FeatureFlags>` rather than a nullable
/// pointer; these helpers let call sites avoid matching on `Option` at every
/// check site.
pub fn enabled(flags: Option<&FeatureFlags>, get: impl Fn(&FeatureFlags) -> bool) -> bool {
    flags.map(get).unwrap_or(false)
}

fn env_keys() -> Vec<&'static str> {
    let mut keys = vec![
        "enableRiskEnforcement",
        "enableMutexProtection",
        "enablePersistence",
        "enableGuardedStopLoss",
    ];
    keys.extend(LEGACY_ALIASES.iter().map(|(alias, _)| *alias));
    keys
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

    #[test]
    fn apply_leaves_unset_fields_untouched() {
        let flags = FeatureFlags::new(FeatureFlagState {
            enable_guarded_stop_loss: true,
            enable_mutex_protection: true,
            enable_persistence: false,
            enable_risk_enforcement: false,
        });

        let state = flags.apply(FlagUpdate {
            enable_persistence: Some(true),
            ..Default::default()
        });

        assert!(state.enable_guarded_stop_loss);
        assert!(state.enable_mutex_protection);
        assert!(state.enable_persistence);
        assert!(!state.enable_risk_enforcement);
    }

    #[test]
    fn null_receiver_reads_false() {
        assert!(!enabled(None, |f| f.enable_risk_enforcement()));
    }

    #[test]
    fn canonical_name_resolves_legacy_alias() {
        assert_eq!(
            canonical_name("ENABLE_RISK_LIMITS"),
            Some("enableRiskEnforcement")
        );
        assert_eq!(canonical_name("enablePersistence"), Some("enablePersistence"));
        assert_eq!(canonical_name("NOT_A_FLAG"), None);
    }
}
