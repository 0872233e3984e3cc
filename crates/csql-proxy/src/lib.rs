//! Binary surface of the proxy: CLI and config resolution, logging,
//! lifecycle, and the operator-facing HTTP endpoints.

pub mod admin;
pub mod cli;
pub mod config_file;
pub mod health;
pub mod lifecycle;
pub mod logging;
