//! Tunables for issuance, lockout and hashing.
//!
//! A policy can be built in code or loaded from TOML:
//!
//! ```toml
//! code_ttl_secs = 2592000
//! lockout_threshold = 5
//! lockout_secs = 1800
//! index_key = "5c1f...e9"
//!
//! [hash_cost]
//! memory_kib = 19456
//! iterations = 2
//! parallelism = 1
//! ```
use chrono::Duration;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::ConfigError;

const THIRTY_DAYS_SECS: i64 = 30 * 24 * 60 * 60;

/// Argon2id cost parameters for code hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl HashCost {
    /// Smallest cost argon2 accepts. Only suitable for tests.
    pub fn minimal() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodePolicy {
    pub code_ttl_secs: i64,
    pub lockout_threshold: u32,
    pub lockout_secs: i64,
    pub max_generation_attempts: u32,
    pub batch_parallelism: usize,
    pub reservation_grace_secs: i64,
    pub hash_cost: HashCost,
    /// Hex encoded HMAC key for code fingerprints. Must be stable across
    /// restarts or the uniqueness index stops matching older codes.
    pub index_key: Option<String>,
}

impl Default for CodePolicy {
    fn default() -> Self {
        Self {
            code_ttl_secs: THIRTY_DAYS_SECS,
            lockout_threshold: 5,
            lockout_secs: 30 * 60,
            max_generation_attempts: 100,
            batch_parallelism: 4,
            reservation_grace_secs: 60,
            hash_cost: HashCost::default(),
            index_key: None,
        }
    }
}

impl CodePolicy {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let policy: CodePolicy = toml::from_str(raw)?;
        policy.validate()?;
        Ok(policy)
    }
    pub fn set_hash_cost(mut self, cost: HashCost) -> Self {
        self.hash_cost = cost;
        self
    }
    pub fn set_index_key(mut self, key: &[u8]) -> Self {
        self.index_key = Some(hex::encode(key));
        self
    }
    pub fn set_max_generation_attempts(mut self, attempts: u32) -> Self {
        self.max_generation_attempts = attempts;
        self
    }
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.code_ttl_secs <= 0 {
            return Err(ConfigError::Zero("code_ttl_secs"));
        }
        if self.lockout_threshold == 0 {
            return Err(ConfigError::Zero("lockout_threshold"));
        }
        if self.lockout_secs <= 0 {
            return Err(ConfigError::Zero("lockout_secs"));
        }
        if self.max_generation_attempts == 0 {
            return Err(ConfigError::Zero("max_generation_attempts"));
        }
        if self.batch_parallelism == 0 {
            return Err(ConfigError::Zero("batch_parallelism"));
        }
        if let Some(key) = &self.index_key {
            hex::decode(key)?;
        }
        Ok(())
    }
    pub fn code_ttl(&self) -> Duration {
        Duration::seconds(self.code_ttl_secs)
    }
    pub fn lockout_duration(&self) -> Duration {
        Duration::seconds(self.lockout_secs)
    }
    pub fn reservation_grace(&self) -> Duration {
        Duration::seconds(self.reservation_grace_secs)
    }
    /// Decoded fingerprint key, or a random one for this process when unset.
    pub fn index_key_bytes(&self) -> Result<Zeroizing<Vec<u8>>, ConfigError> {
        match &self.index_key {
            Some(key) => Ok(Zeroizing::new(hex::decode(key)?)),
            None => {
                tracing::warn!(
                    "no index_key configured, fingerprints will not survive a restart"
                );
                let mut key = Zeroizing::new(vec![0u8; 32]);
                OsRng.fill_bytes(&mut key);
                Ok(key)
            }
        }
    }
}
