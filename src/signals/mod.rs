//! In-band completion signals emitted by worker CLIs.
//!
//! The signal contract is the sole protocol between a worker and the core:
//! a worker prints `AUTONOMOUS_SIGNAL:<marker>` lines into its own output
//! stream, and the supervisor classifies the log after the process exits.

mod parser;
mod types;

pub use parser::{parse_log, parse_log_file};
pub use types::{LogSignals, Verdict};
