//! PTY echo suppression.
//!
//! The worker CLIs echo their own stdin, so the first occurrence of the
//! prompt text in the output stream is elided before it reaches the log.
//! The stripper consumes a sliding expected-echo buffer character by
//! character; after a timeout (3 s by default) suppression is abandoned and
//! any partially-consumed bytes are flushed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct EchoStripper {
    expected: Vec<u8>,
    matched: usize,
    done: bool,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl EchoStripper {
    pub fn new(prompt: &str, timeout: Duration) -> Self {
        let expected = prompt.as_bytes().to_vec();
        Self {
            done: expected.is_empty(),
            expected,
            matched: 0,
            timeout,
            deadline: None,
        }
    }

    /// Filter one chunk of PTY output, returning the bytes to keep. The
    /// timeout clock starts at the first call.
    pub fn filter(&mut self, input: &[u8], now: Instant) -> Vec<u8> {
        if self.done {
            return input.to_vec();
        }
        let deadline = *self.deadline.get_or_insert(now + self.timeout);
        if now >= deadline {
            let mut out = self.flush();
            out.extend_from_slice(input);
            return out;
        }

        let mut out = Vec::with_capacity(input.len());
        let mut pending: VecDeque<u8> = input.iter().copied().collect();
        while let Some(byte) = pending.pop_front() {
            if self.done {
                out.push(byte);
                continue;
            }
            if byte == self.expected[self.matched] {
                self.matched += 1;
                if self.matched == self.expected.len() {
                    self.done = true;
                    self.matched = 0;
                }
                continue;
            }
            if self.matched == 0 {
                out.push(byte);
                continue;
            }
            // The first held byte cannot start the echo after all: emit it
            // and retry the rest of the hold (plus this byte), which may
            // contain an overlapping echo start.
            out.push(self.expected[0]);
            pending.push_front(byte);
            for &held in self.expected[1..self.matched].iter().rev() {
                pending.push_front(held);
            }
            self.matched = 0;
        }
        out
    }

    /// Abandon suppression, returning any partially-consumed bytes. Called
    /// on stream end and on timeout.
    pub fn flush(&mut self) -> Vec<u8> {
        let held = self.expected[..self.matched].to_vec();
        self.matched = 0;
        self.done = true;
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(stripper: &mut EchoStripper, chunks: &[&[u8]]) -> Vec<u8> {
        let now = Instant::now();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(stripper.filter(chunk, now));
        }
        out.extend(stripper.flush());
        out
    }

    #[test]
    fn test_exact_echo_is_stripped() {
        let mut s = EchoStripper::new("implement issue 42", Duration::from_secs(3));
        let out = run(&mut s, &[b"implement issue 42", b"\r\nworking...\n"]);
        assert_eq!(out, b"\r\nworking...\n");
    }

    #[test]
    fn test_second_occurrence_is_kept() {
        let mut s = EchoStripper::new("hello", Duration::from_secs(3));
        let out = run(&mut s, &[b"hellohello"]);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_echo_split_across_chunks() {
        let mut s = EchoStripper::new("hello world", Duration::from_secs(3));
        let out = run(&mut s, &[b"hel", b"lo wo", b"rld done"]);
        assert_eq!(out, b" done");
    }

    #[test]
    fn test_banner_before_echo_passes_through() {
        let mut s = EchoStripper::new("prompt", Duration::from_secs(3));
        let out = run(&mut s, &[b"Welcome v1.2\nprompt\n"]);
        assert_eq!(out, b"Welcome v1.2\n\n");
    }

    #[test]
    fn test_partial_match_is_flushed_on_mismatch() {
        let mut s = EchoStripper::new("abcdef", Duration::from_secs(3));
        let out = run(&mut s, &[b"abcX"]);
        // "abc" was held as a candidate echo, then flushed with the 'X'.
        assert_eq!(out, b"abcX");
    }

    #[test]
    fn test_mismatch_byte_can_restart_a_match() {
        let mut s = EchoStripper::new("aab", Duration::from_secs(3));
        let out = run(&mut s, &[b"aaab"]);
        assert_eq!(out, b"a");
    }

    #[test]
    fn test_timeout_abandons_suppression() {
        let mut s = EchoStripper::new("never echoed", Duration::from_millis(10));
        let start = Instant::now();
        let first = s.filter(b"neve", start);
        assert!(first.is_empty());
        let late = s.filter(b"output after timeout", start + Duration::from_millis(20));
        assert_eq!(late, b"neveoutput after timeout");
        // Suppression stays off afterwards.
        assert_eq!(s.filter(b"never echoed", start + Duration::from_secs(1)), b"never echoed");
    }

    #[test]
    fn test_empty_prompt_disables_stripping() {
        let mut s = EchoStripper::new("", Duration::from_secs(3));
        assert_eq!(s.filter(b"anything", Instant::now()), b"anything");
    }

    #[test]
    fn test_flush_on_clean_stream_end_is_empty() {
        let mut s = EchoStripper::new("prompt", Duration::from_secs(3));
        let _ = s.filter(b"prompt", Instant::now());
        assert!(s.flush().is_empty());
    }
}
