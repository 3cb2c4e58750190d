use regex::bytes::Regex;

/// Result of feeding bytes into a [`Framer`].
#[derive(Debug, Default, PartialEq)]
pub struct FramerOutput {
    /// Complete messages, in arrival order. Empty segments are discarded.
    pub messages: Vec<String>,
    /// The buffer exceeded capacity while data was pending; the caller
    /// should flush its batch now.
    pub overflowed: bool,
    /// Bytes discarded because a single unterminated message outgrew the
    /// buffer capacity.
    pub dropped_bytes: usize,
}

/// Splits an incoming byte stream into messages on a delimiter regex.
///
/// Everything before the last delimiter match is complete; the tail stays
/// buffered for the next read. The buffer is kept as raw bytes so a UTF-8
/// character split across two reads reassembles correctly.
pub struct Framer {
    delimiter: Regex,
    capacity: usize,
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new(pattern: &str, capacity: usize) -> Result<Self, regex::Error> {
        Ok(Self {
            delimiter: Regex::new(pattern)?,
            capacity,
            buffer: Vec::new(),
        })
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn push(&mut self, data: &[u8]) -> FramerOutput {
        self.buffer.extend_from_slice(data);
        let overflowed = self.buffer.len() > self.capacity;

        let mut messages = Vec::new();
        let mut tail_start = 0;
        for m in self.delimiter.find_iter(&self.buffer) {
            // A zero-width match would never advance; treat it as no boundary.
            if m.end() == m.start() {
                continue;
            }
            let segment = &self.buffer[tail_start..m.start()];
            if !segment.is_empty() {
                messages.push(String::from_utf8_lossy(segment).into_owned());
            }
            tail_start = m.end();
        }
        self.buffer.drain(..tail_start);

        // Whatever remains is one unterminated message. If it alone exceeds
        // capacity it can never complete: drop it.
        let mut dropped_bytes = 0;
        if self.buffer.len() > self.capacity {
            dropped_bytes = self.buffer.len();
            self.buffer.clear();
        }

        FramerOutput { messages, overflowed, dropped_bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_boundary_case() {
        let mut framer = Framer::new(r"\r?\n", 1024).unwrap();
        let out = framer.push(b"a\nb\r\nc");
        assert_eq!(out.messages, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(framer.buffered(), b"c");
        assert!(!out.overflowed);
        assert_eq!(out.dropped_bytes, 0);
    }

    #[test]
    fn tail_completes_on_next_push() {
        let mut framer = Framer::new(r"\n", 1024).unwrap();
        assert!(framer.push(b"par").messages.is_empty());
        let out = framer.push(b"tial\nnext");
        assert_eq!(out.messages, vec!["partial".to_string()]);
        assert_eq!(framer.buffered(), b"next");
    }

    #[test]
    fn empty_segments_are_discarded() {
        let mut framer = Framer::new(r"\n", 1024).unwrap();
        let out = framer.push(b"a\n\n\nb\n");
        assert_eq!(out.messages, vec!["a".to_string(), "b".to_string()]);
        assert!(framer.buffered().is_empty());
    }

    #[test]
    fn over_capacity_with_boundaries_flags_overflow() {
        let mut framer = Framer::new(r"\n", 8).unwrap();
        let out = framer.push(b"aaaa\nbbbb\n");
        assert!(out.overflowed);
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.dropped_bytes, 0);
    }

    #[test]
    fn single_oversized_message_is_dropped() {
        let mut framer = Framer::new(r"\n", 8).unwrap();
        let out = framer.push(b"0123456789abcdef");
        assert!(out.messages.is_empty());
        assert_eq!(out.dropped_bytes, 16);
        assert!(framer.buffered().is_empty());

        // The framer keeps working afterwards.
        let out = framer.push(b"ok\n");
        assert_eq!(out.messages, vec!["ok".to_string()]);
    }

    #[test]
    fn utf8_char_split_across_reads_reassembles() {
        let bytes = "température\n".as_bytes();
        let mut framer = Framer::new(r"\n", 1024).unwrap();
        // Split in the middle of the two-byte 'é'.
        assert!(framer.push(&bytes[..5]).messages.is_empty());
        let out = framer.push(&bytes[5..]);
        assert_eq!(out.messages, vec!["température".to_string()]);
    }
}
