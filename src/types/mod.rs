//! Shared value types used across the account subsystem.

pub mod units;

pub use units::{btc_to_sats, parse_btc, parse_sats, sats_to_btc_string, sats_to_display, SATS_PER_BTC};
