//! Signal extraction from worker output logs.
//!
//! Pure functions over log text. Explicit markers are lines beginning with
//! `AUTONOMOUS_SIGNAL:`; a secondary phrase heuristic catches PR creation
//! that a worker announced without emitting the marker.

use super::types::LogSignals;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

const SIGNAL_PREFIX: &str = "AUTONOMOUS_SIGNAL:";

static PR_PHRASE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)pull request (?:created|opened|updated)|(?:created|opened) (?:a )?pull request|pr created")
        .unwrap()
});

static PR_NUMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\d+)\b").unwrap());

/// Extract all signals from the full text of a worker log.
pub fn parse_log(text: &str) -> LogSignals {
    let mut signals = LogSignals::default();

    for raw_line in text.lines() {
        // Markers must start the line. Indented copies (the prompt's own
        // contract block echoed back through the PTY) do not count. PTY
        // output carries \r line endings; trim those.
        let line = raw_line.trim_end();
        let Some(marker) = line.strip_prefix(SIGNAL_PREFIX) else {
            continue;
        };
        let marker = marker.trim();

        if marker == "COMPLETE" {
            signals.complete = true;
        } else if let Some(number) = marker.strip_prefix("PR:") {
            if let Ok(n) = number.trim().parse::<u64>() {
                signals.pr_number = Some(n);
            }
        } else if let Some(reason) = marker.strip_prefix("BLOCKED:") {
            let reason = reason.trim();
            if !reason.is_empty() {
                signals.blocked = Some(reason.to_string());
            }
        } else if let Some(reason) = marker.strip_prefix("FAILED:") {
            let reason = reason.trim();
            if !reason.is_empty() {
                signals.failed = Some(reason.to_string());
            }
        }
    }

    if PR_PHRASE_REGEX.is_match(text) {
        signals.heuristic_pr = PR_NUMBER_REGEX
            .captures_iter(text)
            .last()
            .and_then(|cap| cap.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok());
    }

    signals
}

/// Read a log file and extract its signals. Invalid UTF-8 is replaced, not
/// rejected — worker CLIs emit arbitrary terminal bytes.
pub fn parse_log_file(path: &Path) -> std::io::Result<LogSignals> {
    let bytes = std::fs::read(path)?;
    Ok(parse_log(&String::from_utf8_lossy(&bytes)))
}
