//! Vulnerability probing of captured requests

mod command_injection;

pub use command_injection::{scan_record, verdict_text, PROBES};
