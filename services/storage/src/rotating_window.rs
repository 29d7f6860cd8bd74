//! Fixed-capacity ring buffer used to find a delimiter in a byte stream.
//!
//! The window always holds the most recent `capacity` bytes. A byte leaves the
//! window (and becomes safe to emit) only after `capacity` newer bytes have been
//! seen, so a delimiter of exactly `capacity` bytes can never be split between
//! emitted output and the window.

use std::fmt;

/// Errors raised when building a window.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("Rotating window capacity must be greater than 0")]
    ZeroCapacity,
}

/// Circular byte buffer holding the last `capacity` bytes written.
pub struct RotatingWindow {
    bytes: Box<[u8]>,
    cursor: usize,
    full: bool,
}

impl RotatingWindow {
    /// Create an empty window of the given capacity.
    pub fn new(capacity: usize) -> Result<Self, WindowError> {
        if capacity == 0 {
            return Err(WindowError::ZeroCapacity);
        }

        Ok(Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
            full: false,
        })
    }

    /// Window capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer has wrapped at least once.
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Write a byte, returning the evicted oldest byte once the window is full.
    pub fn put(&mut self, byte: u8) -> Option<u8> {
        let evicted = self.full.then(|| self.bytes[self.cursor]);

        self.bytes[self.cursor] = byte;
        self.cursor += 1;
        if self.cursor == self.bytes.len() {
            self.cursor = 0;
            self.full = true;
        }

        evicted
    }

    /// True when the window is full and its contents, oldest first, equal `target`.
    pub fn matches(&self, target: &[u8]) -> bool {
        if !self.full || target.len() != self.bytes.len() {
            return false;
        }

        let (newest, oldest) = self.bytes.split_at(self.cursor);
        let (head, tail) = target.split_at(oldest.len());
        oldest == head && newest == tail
    }

    /// Window contents, oldest byte first.
    pub fn contents(&self) -> Vec<u8> {
        if self.full {
            let mut out = Vec::with_capacity(self.bytes.len());
            out.extend_from_slice(&self.bytes[self.cursor..]);
            out.extend_from_slice(&self.bytes[..self.cursor]);
            out
        } else {
            self.bytes[..self.cursor].to_vec()
        }
    }
}

impl fmt::Debug for RotatingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotatingWindow")
            .field("capacity", &self.capacity())
            .field("full", &self.full)
            .field("contents", &String::from_utf8_lossy(&self.contents()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(RotatingWindow::new(0).unwrap_err(), WindowError::ZeroCapacity);
    }

    #[test]
    fn test_put_returns_none_until_full() {
        for capacity in 1..=8 {
            let mut window = RotatingWindow::new(capacity).unwrap();
            for i in 0..capacity {
                assert!(!window.is_full(), "full too early at capacity {capacity}");
                assert_eq!(window.put(i as u8), None);
            }
            assert!(window.is_full());

            // Every further write evicts the oldest byte, in write order
            for i in 0..(2 * capacity) {
                assert_eq!(window.put(0xAA), Some(if i < capacity { i as u8 } else { 0xAA }));
            }
        }
    }

    #[test]
    fn test_matches_requires_full_window() {
        let mut window = RotatingWindow::new(3).unwrap();
        window.put(b'a');
        window.put(b'b');
        assert!(!window.matches(b"ab"));
        assert!(!window.matches(b"xab"));

        window.put(b'c');
        assert!(window.matches(b"abc"));
    }

    #[test]
    fn test_matches_rejects_wrong_length() {
        let mut window = RotatingWindow::new(2).unwrap();
        window.put(b'a');
        window.put(b'b');
        assert!(!window.matches(b"b"));
        assert!(!window.matches(b"abc"));
    }

    #[test]
    fn test_matches_tracks_most_recent_bytes() {
        let stream = b"xx\r\n--Babc\r\n--B";
        let target = b"\r\n--B";
        let mut window = RotatingWindow::new(target.len()).unwrap();

        let mut match_ends = Vec::new();
        for (i, &b) in stream.iter().enumerate() {
            window.put(b);
            if window.matches(target) {
                match_ends.push(i);
            }
            // The window mirrors the tail of what has been written so far
            let written = &stream[..=i];
            let start = written.len().saturating_sub(target.len());
            assert_eq!(window.contents(), written[start..].to_vec());
        }

        assert_eq!(match_ends, vec![6, 14]);
    }

    #[test]
    fn test_matches_across_wraparound_positions() {
        // Exercise every cursor offset at which a match can complete
        let target = b"abcd";
        for prefix in 0..8 {
            let mut window = RotatingWindow::new(target.len()).unwrap();
            for _ in 0..prefix {
                window.put(b'z');
            }
            for &b in target {
                window.put(b);
            }
            assert!(window.matches(target), "no match after {prefix} prefix bytes");
            assert!(!window.matches(b"bcda"));
        }
    }

    #[test]
    fn test_debug_renders_oldest_first() {
        let mut window = RotatingWindow::new(3).unwrap();
        for &b in b"hello" {
            window.put(b);
        }
        let rendered = format!("{:?}", window);
        assert!(rendered.contains("llo"));
    }
}
