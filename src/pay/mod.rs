//! Payment handling (spec §4.5): sufficiency checking and the /pay state
//! machine that consumes it.

pub mod orchestrator;
pub mod sufficiency;

pub use orchestrator::{Orchestrator, PayCoin, PayMode, PayOutcome, PayRequest};
