use std::collections::HashMap;

/// RFC 5321 limit for a command line, CRLF excluded
pub const COMMAND_SIZE_LIMIT: usize = 512;

/// Default maximum message size (32 MiB)
pub const DATA_SIZE_DEFAULT: usize = 33_554_432;

/// Extra MAIL line room when SIZE is advertised (` SIZE=` plus the digits)
pub const SIZE_EXTENSION_ROOM: usize = 26;

/// Extra MAIL line room when SMTPUTF8 is advertised
pub const SMTPUTF8_EXTENSION_ROOM: usize = 10;

/// One received line with its CRLF stripped.
///
/// `len` counts every byte the peer sent for the line, `bytes` holds at
/// most as many as the reader was allowed to keep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub bytes: Vec<u8>,
    pub len: usize,
}

impl Line {
    pub fn new(bytes: Vec<u8>, len: usize) -> Self {
        Self { bytes, len }
    }

    pub fn is_truncated(&self) -> bool {
        self.len > self.bytes.len()
    }
}

impl From<&str> for Line {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec(), text.len())
    }
}

/// Maximum line length per command token.
///
/// Only consulted once EHLO was negotiated; plain SMTP uses
/// `COMMAND_SIZE_LIMIT` for everything.
#[derive(Debug, Clone, Default)]
pub struct CommandLimits {
    grown: HashMap<&'static str, usize>,
}

impl CommandLimits {
    pub fn get(&self, command: &str) -> usize {
        self.grown.get(command).copied().unwrap_or(COMMAND_SIZE_LIMIT)
    }

    pub fn grow(&mut self, command: &'static str, by: usize) {
        *self.grown.entry(command).or_insert(COMMAND_SIZE_LIMIT) += by;
    }

    /// Largest limit of any command, used to bound the line reader
    pub fn max(&self) -> usize {
        self.grown
            .values()
            .copied()
            .fold(COMMAND_SIZE_LIMIT, usize::max)
    }
}

/// Reverses DATA transparency: a leading dot is an escape and goes away
pub fn unstuff(line: &[u8]) -> &[u8] {
    match line.first() {
        Some(b'.') => &line[1..],
        _ => line,
    }
}

/// Body of the message being received in the DATA phase
#[derive(Debug, Default)]
pub struct MessageBuffer {
    body: Vec<u8>,
    lines: usize,
    num_bytes: usize,
    limit: Option<usize>,
}

impl MessageBuffer {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Appends a body line. Once the limit is passed, bytes are only
    /// counted.
    pub fn push_line(&mut self, line: &Line) {
        self.num_bytes += line.len + 2;
        if self.exceeded() {
            return;
        }

        if self.lines > 0 {
            self.body.push(b'\n');
        }
        self.body.extend_from_slice(unstuff(&line.bytes));
        self.lines += 1;
    }

    pub fn exceeded(&self) -> bool {
        match self.limit {
            Some(limit) => self.num_bytes > limit,
            None => false,
        }
    }

    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    pub fn clear(&mut self) {
        self.body.clear();
        self.lines = 0;
        self.num_bytes = 0;
    }

    pub fn take(&mut self) -> Vec<u8> {
        let body = std::mem::take(&mut self.body);
        self.clear();
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_limits_grow() {
        let mut limits = CommandLimits::default();
        assert_eq!(limits.get("MAIL"), 512);
        assert_eq!(limits.max(), 512);

        limits.grow("MAIL", SIZE_EXTENSION_ROOM);
        limits.grow("MAIL", SMTPUTF8_EXTENSION_ROOM);
        assert_eq!(limits.get("MAIL"), 548);
        assert_eq!(limits.get("RCPT"), 512);
        assert_eq!(limits.max(), 548);
    }

    #[test]
    fn test_unstuff() {
        assert_eq!(unstuff(b".foo"), b"foo");
        assert_eq!(unstuff(b".."), b".");
        assert_eq!(unstuff(b"foo."), b"foo.");
        assert_eq!(unstuff(b""), b"");
    }

    #[test]
    fn test_message_buffer() {
        let mut buffer = MessageBuffer::new(None);
        buffer.push_line(&Line::from("Subject: hi"));
        buffer.push_line(&Line::from(""));
        buffer.push_line(&Line::from(".foo"));
        assert_eq!(buffer.num_bytes(), 11 + 2 + 2 + 4 + 2);
        assert_eq!(buffer.take(), b"Subject: hi\n\nfoo");
        assert_eq!(buffer.num_bytes(), 0);
    }

    #[test]
    fn test_message_buffer_limit() {
        let mut buffer = MessageBuffer::new(Some(10));
        buffer.push_line(&Line::from("12345678"));
        assert!(!buffer.exceeded());
        buffer.push_line(&Line::from("x"));
        assert!(buffer.exceeded());

        buffer.clear();
        assert!(!buffer.exceeded());
        buffer.push_line(&Line::from("ok"));
        assert_eq!(buffer.take(), b"ok");
    }
}
