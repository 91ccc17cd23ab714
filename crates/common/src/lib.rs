//! Shared utilities for drip binaries: logging bootstrap and configuration
//! file loading.

pub mod utils;
