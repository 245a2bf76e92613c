//! Per-direction byte accumulation.
//!
//! A `StreamBuffer` holds the ordered bytes of one direction of a flow,
//! a parse cursor and the start offset of the message currently being
//! framed. After a message is dispatched the consumed prefix is discarded
//! so the buffer always begins at the next message's first byte.

/// Append-only byte buffer with a parse cursor.
///
/// Invariant: `message_start <= parse_offset <= data.len()`.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    data: Vec<u8>,
    parse_offset: usize,
    message_start: usize,
    body_received: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The bytes at and beyond the parse cursor.
    pub fn unparsed(&self) -> &[u8] {
        &self.data[self.parse_offset..]
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.parse_offset
    }

    pub fn parse_offset(&self) -> usize {
        self.parse_offset
    }

    pub fn message_start(&self) -> usize {
        self.message_start
    }

    pub fn body_received(&self) -> usize {
        self.body_received
    }

    /// Move the cursor forward over `n` parsed bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.parse_offset + n <= self.data.len());
        self.parse_offset += n;
    }

    /// Move the cursor to the end of the buffered data.
    pub fn advance_to_end(&mut self) {
        self.parse_offset = self.data.len();
    }

    /// Record the cursor as the first byte of a new message.
    pub fn mark_message_start(&mut self) {
        self.message_start = self.parse_offset;
    }

    pub fn add_body_received(&mut self, n: usize) {
        self.body_received += n;
    }

    pub fn reset_body_received(&mut self) {
        self.body_received = 0;
    }

    /// Discard everything before `end` after a message was dispatched.
    ///
    /// The cursor keeps its position relative to the retained bytes, so
    /// pipelined data that was already buffered stays parseable.
    pub fn compact(&mut self, end: usize) {
        debug_assert!(end <= self.data.len());
        self.data.drain(..end);
        self.parse_offset = self.parse_offset.saturating_sub(end);
        self.message_start = 0;
        self.body_received = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_and_advance() {
        let mut buf = StreamBuffer::new();
        buf.append(b"hello");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.unparsed(), b"hello");
        buf.advance(3);
        assert_eq!(buf.unparsed(), b"lo");
        assert_eq!(buf.remaining(), 2);
    }

    #[test]
    fn compaction_resets_cursors() {
        let mut buf = StreamBuffer::new();
        buf.append(b"first|second");
        buf.advance(6);
        buf.add_body_received(4);
        buf.compact(6);
        assert_eq!(buf.data(), b"second");
        assert_eq!(buf.parse_offset(), 0);
        assert_eq!(buf.message_start(), 0);
        assert_eq!(buf.body_received(), 0);
    }

    #[test]
    fn compaction_keeps_cursor_past_end() {
        // A truncated message may pin its end before the cursor; the
        // cursor must stay aligned with the retained bytes.
        let mut buf = StreamBuffer::new();
        buf.append(b"abcdef");
        buf.advance(6);
        buf.compact(4);
        assert_eq!(buf.data(), b"ef");
        assert_eq!(buf.parse_offset(), 2);
    }

    #[test]
    fn message_start_marks_cursor() {
        let mut buf = StreamBuffer::new();
        buf.append(b"xxmsg");
        buf.advance(2);
        buf.mark_message_start();
        assert_eq!(buf.message_start(), 2);
    }
}
