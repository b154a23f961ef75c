//! Store key derivation for a region.
//!
//! Every region owns three key families in the store:
//!
//! - `<ns>_generation`: the authoritative generation counter
//! - `<ns>_keys`: the live-key set, renamed away on clear
//! - `<ns>:<generation>:<tags><key>`: entry keys
//!
//! where `<ns>` is `<prefix>_<region>`, or just `<region>` without a prefix.
//! Logical keys are escaped (`\` as `\\`, `#` as `\#`) so the leading run of
//! `#` tags can never be confused with key text.

use regioncache_core::{RegionCacheResult, ValidationError};
use std::sync::atomic::{AtomicI64, Ordering};

/// Local generation before the first sync with the store.
pub const UNINITIALIZED_GENERATION: i64 = -1;

/// Shared list of abandoned live-key sets, drained by an external reaper.
pub const GARBAGE_LIST_KEY: &str = "regioncache:garbage";

/// Tag count of lock keys.
pub const LOCK_TAGS: usize = 1;

/// Key derivation and the locally cached generation of one region.
#[derive(Debug)]
pub struct KeyNamespace {
    region: String,
    namespace: String,
    generation: AtomicI64,
}

impl KeyNamespace {
    pub fn new(region: impl Into<String>, prefix: Option<&str>) -> RegionCacheResult<Self> {
        let region = region.into();
        if region.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "region".to_string(),
            }
            .into());
        }
        if region.contains(':') {
            return Err(ValidationError::InvalidValue {
                field: "region".to_string(),
                reason: "must not contain ':'".to_string(),
            }
            .into());
        }

        let namespace = match prefix.filter(|p| !p.is_empty()) {
            Some(prefix) => format!("{}_{}", prefix, region),
            None => region.clone(),
        };

        Ok(Self {
            region,
            namespace,
            generation: AtomicI64::new(UNINITIALIZED_GENERATION),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// `<prefix>_<region>` or `<region>`.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn generation_key(&self) -> String {
        format!("{}_generation", self.namespace)
    }

    pub fn global_keys_key(&self) -> String {
        format!("{}_keys", self.namespace)
    }

    pub fn garbage_list_key(&self) -> &'static str {
        GARBAGE_LIST_KEY
    }

    /// Name the live-key set is renamed to when `generation` is abandoned.
    pub fn abandoned_keys_key(&self, generation: i64) -> String {
        format!("temp_{}_{}", self.global_keys_key(), generation)
    }

    /// Entry key under the locally cached generation.
    pub fn global_key(&self, key: &str, tags: usize) -> String {
        self.global_key_at(key, tags, self.generation())
    }

    pub fn global_key_at(&self, key: &str, tags: usize, generation: i64) -> String {
        let mut out = String::with_capacity(self.namespace.len() + key.len() + tags + 24);
        out.push_str(&self.namespace);
        out.push(':');
        out.push_str(&generation.to_string());
        out.push(':');
        for _ in 0..tags {
            out.push('#');
        }
        for c in key.chars() {
            if c == '\\' || c == '#' {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }

    pub fn generation(&self) -> i64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn set_generation(&self, generation: i64) {
        self.generation.store(generation, Ordering::Release);
    }

    pub fn is_synced(&self) -> bool {
        self.generation() != UNINITIALIZED_GENERATION
    }
}
