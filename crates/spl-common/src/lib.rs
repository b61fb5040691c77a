//! Shared building blocks for the SPL warehouse loader.
//!
//! This crate holds the pieces every other workspace member needs: the
//! error type that models the loader's failure policy, the logging
//! bootstrap, and archive checksum utilities.

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{EtlError, Result};
