//! Pickup code generation and hashing.
//!
//! Codes are six decimal digits drawn from the OS random source. Only an
//! argon2id hash is ever persisted; the plaintext lives in a [`PlainCode`]
//! that is wiped when dropped.
//!
//! A second, keyed digest (the fingerprint) lets the store detect two live
//! codes with the same value without running argon2 against every active
//! hash.
use std::fmt;
use std::str::FromStr;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::{CodePolicy, HashCost};
use crate::error::{CodeError, ConfigError, StoreError};

pub const CODE_MIN: u32 = 100_000;
pub const CODE_MAX: u32 = 999_999;
pub const CODE_LEN: usize = 6;

type HmacSha256 = Hmac<Sha256>;

/// Plaintext pickup code. Redacted in `Debug`, zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PlainCode(String);

impl PlainCode {
    fn from_value(value: u32) -> Self {
        Self(format!("{:0width$}", value, width = CODE_LEN))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PlainCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlainCode(******)")
    }
}

impl FromStr for PlainCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != CODE_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodeError::InvalidCode);
        }
        let value: u32 = s.parse().map_err(|_| CodeError::InvalidCode)?;
        if !(CODE_MIN..=CODE_MAX).contains(&value) {
            return Err(CodeError::InvalidCode);
        }
        Ok(Self(s.to_string()))
    }
}

type Draw = Box<dyn Fn() -> u32 + Send + Sync>;

pub struct CodeGenerator {
    max_attempts: u32,
    draw: Draw,
}

fn os_draw() -> u32 {
    OsRng.gen_range(CODE_MIN..=CODE_MAX)
}

impl CodeGenerator {
    pub fn new(policy: &CodePolicy) -> Self {
        Self {
            max_attempts: policy.max_generation_attempts,
            draw: Box::new(os_draw),
        }
    }

    /// A generator whose candidates come from `draw` rather than the OS rng.
    #[cfg(test)]
    pub(crate) fn with_draw<D>(policy: &CodePolicy, draw: D) -> Self
    where
        D: Fn() -> u32 + Send + Sync + 'static,
    {
        Self {
            max_attempts: policy.max_generation_attempts,
            draw: Box::new(draw),
        }
    }

    /// Draw candidates until `is_taken` accepts one.
    ///
    /// `is_taken` returns `Ok(true)` when the candidate collides with a live
    /// code. After `max_attempts` collisions this gives up with
    /// [`CodeError::GenerationExhausted`].
    pub fn generate<F>(&self, mut is_taken: F) -> Result<PlainCode, CodeError>
    where
        F: FnMut(&PlainCode) -> Result<bool, CodeError>,
    {
        for attempt in 1..=self.max_attempts {
            let candidate = PlainCode::from_value((self.draw)());
            if !is_taken(&candidate)? {
                return Ok(candidate);
            }
            tracing::debug!(attempt, "candidate code collides with an active code");
        }
        Err(CodeError::GenerationExhausted)
    }
}

pub struct CodeHasher {
    argon2: Argon2<'static>,
    mac: HmacSha256,
}

impl CodeHasher {
    pub fn new(policy: &CodePolicy) -> Result<Self, ConfigError> {
        let key = policy.index_key_bytes()?;
        let mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| ConfigError::HashCost(format!("index key: {e}")))?;

        Ok(Self {
            argon2: argon2_with(policy.hash_cost)?,
            mac,
        })
    }

    pub fn hash(&self, code: &PlainCode) -> Result<String, StoreError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(code.as_str().as_bytes(), &salt)
            .map_err(|e| StoreError::Hash(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// Check a candidate against a stored PHC string. A malformed hash never
    /// verifies.
    pub fn verify(&self, candidate: &PlainCode, phc: &str) -> bool {
        match PasswordHash::new(phc) {
            Ok(parsed) => self
                .argon2
                .verify_password(candidate.as_str().as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "stored code hash is not a valid PHC string");
                false
            }
        }
    }

    pub fn fingerprint(&self, code: &PlainCode) -> String {
        let mut mac = self.mac.clone();
        mac.update(code.as_str().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

fn argon2_with(cost: HashCost) -> Result<Argon2<'static>, ConfigError> {
    let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
        .map_err(|e| ConfigError::HashCost(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}
