//! One-time pickup codes for releasing packages at a warehouse counter.
//!
//! When a shipment arrives every package in it is issued a six digit code.
//! The recipient presents the code and their suite number at the counter and
//! staff verify it through [`service::PickupCodeService`]. Codes are stored
//! only as argon2id hashes, are single use, expire, and lock the package
//! after repeated failures. Every attempt lands in a hash-chained audit log.

pub mod audit;
pub mod authority;
pub mod clock;
pub mod code;
pub mod config;
pub mod error;
pub mod issuer;
pub mod lockout;
pub mod model;
pub mod notify;
pub mod service;
pub mod store;
pub mod utils;
pub mod verifier;

pub use error::{CodeError, ConfigError, StoreError};
pub use service::PickupCodeService;
