//! Capture of script `print` output.
//!
//! Each `print` statement produces one formatted line. Lines are handed to
//! the host sink (if one is installed) as they happen, and retained in a
//! bounded buffer between explicit reads.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Which end of the buffer gives way when the size limit is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Truncation {
    /// Drop the oldest retained lines to make room for new ones.
    Oldest,
    /// Drop incoming lines once the buffer is full.
    Newest,
}

/// How much printed output is retained between reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapturePolicy {
    /// Keep everything until the host drains the buffer.
    Unlimited,
    /// Keep at most `bytes` of formatted output (newlines included).
    MaxSize { bytes: usize, truncation: Truncation },
}

impl Default for CapturePolicy {
    fn default() -> Self {
        CapturePolicy::Unlimited
    }
}

/// Bounded line buffer between the script's `print` and the host.
pub struct OutputBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    policy: CapturePolicy,
    dropped: usize,
}

impl OutputBuffer {
    pub fn new(policy: CapturePolicy) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            policy,
            dropped: 0,
        }
    }

    /// Retain one formatted line (without its trailing newline).
    pub fn push(&mut self, line: String) {
        let cost = line.len() + 1; // the newline added on read-out
        match self.policy {
            CapturePolicy::Unlimited => {
                self.bytes += cost;
                self.lines.push_back(line);
            }
            CapturePolicy::MaxSize { bytes: limit, truncation: Truncation::Newest } => {
                if self.bytes + cost > limit {
                    self.dropped += 1;
                    warn!(dropped = self.dropped, "print capture full, dropping newest line");
                } else {
                    self.bytes += cost;
                    self.lines.push_back(line);
                }
            }
            CapturePolicy::MaxSize { bytes: limit, truncation: Truncation::Oldest } => {
                while !self.lines.is_empty() && self.bytes + cost > limit {
                    if let Some(evicted) = self.lines.pop_front() {
                        self.bytes -= evicted.len() + 1;
                        self.dropped += 1;
                    }
                }
                if cost > limit {
                    // Line alone exceeds the whole budget.
                    self.dropped += 1;
                    warn!(dropped = self.dropped, "print line exceeds capture budget, dropping");
                } else {
                    self.bytes += cost;
                    self.lines.push_back(line);
                }
            }
        }
    }

    /// Drain everything retained so far, newline-terminated per line.
    pub fn take(&mut self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for line in self.lines.drain(..) {
            out.push_str(&line);
            out.push('\n');
        }
        self.bytes = 0;
        out
    }

    /// Lines dropped by the policy since creation. Diagnostic only.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_keeps_order() {
        let mut buffer = OutputBuffer::new(CapturePolicy::Unlimited);
        buffer.push("a".into());
        buffer.push("b".into());
        assert_eq!(buffer.take(), "a\nb\n");
        assert!(buffer.is_empty());
        // Drained; next read starts fresh.
        buffer.push("c".into());
        assert_eq!(buffer.take(), "c\n");
    }

    #[test]
    fn test_truncate_newest_drops_incoming() {
        let policy = CapturePolicy::MaxSize { bytes: 4, truncation: Truncation::Newest };
        let mut buffer = OutputBuffer::new(policy);
        buffer.push("ab".into()); // 3 bytes with newline
        buffer.push("cd".into()); // would exceed 4
        assert_eq!(buffer.take(), "ab\n");
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn test_truncate_oldest_evicts_from_front() {
        let policy = CapturePolicy::MaxSize { bytes: 6, truncation: Truncation::Oldest };
        let mut buffer = OutputBuffer::new(policy);
        buffer.push("ab".into());
        buffer.push("cd".into());
        buffer.push("ef".into()); // evicts "ab"
        assert_eq!(buffer.take(), "cd\nef\n");
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn test_oversized_line_is_dropped_entirely() {
        let policy = CapturePolicy::MaxSize { bytes: 3, truncation: Truncation::Oldest };
        let mut buffer = OutputBuffer::new(policy);
        buffer.push("toolong".into());
        assert_eq!(buffer.take(), "");
        assert_eq!(buffer.dropped(), 1);
    }
}
