//! # Tally Common Library
//!
//! Shared code for the contribution tally services:
//! - Common error type
//! - TOML configuration model and path resolution
//! - UUID and timestamp helpers

pub mod config;
pub mod error;
pub mod time;
pub mod uuid_utils;

pub use error::{Error, Result};
