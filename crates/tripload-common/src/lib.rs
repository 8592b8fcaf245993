//! Tripload Common Library
//!
//! Shared error type, logging setup and checksum helpers used by the
//! tripload workspace members.
//!
//! # Example
//!
//! ```no_run
//! use tripload_common::checksum::sha256_hex;
//!
//! let digest = sha256_hex(b"trip file");
//! assert_eq!(digest.len(), 64);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, TriploadError};
