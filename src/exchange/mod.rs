//! Exchange liaison pool: connection, key, and fee bookkeeping (spec §4.3).

pub mod client;
pub mod liaison;

pub use liaison::{ExchangeLiaison, FindExchangeOutcome, Keys};
