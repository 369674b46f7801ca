//! Core primitives.
//!
//! Configuration, token units and timestamps shared by the wager and network layers.

pub mod config;
pub mod units;
pub mod time;

// Re-export core types
pub use config::{AppConfig, ChainId, ConfigError, ContractAddresses};
pub use units::{format_token_amount, parse_token_amount, UnitsError, TOKEN_DECIMALS};
pub use time::{unix_now, UnixSeconds, SECONDS_PER_DAY};
