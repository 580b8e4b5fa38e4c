//! Utilities shared across the drivers.
//!
//! - [`tls`]: `ssl_mode` handling for every driver

pub mod tls;

pub use tls::SslMode;
