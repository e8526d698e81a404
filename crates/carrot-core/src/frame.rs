//! Wire frames exchanged with a connection's transport

/// Separator between messages coalesced into one outbound frame.
pub const BATCH_DELIMITER: char = '\n';

/// Transport-neutral frame. The gateway maps its WebSocket messages onto
/// this so the pumps never see a concrete socket type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Collapse embedded newlines to spaces and trim surrounding whitespace.
pub fn normalize_inbound(text: &str) -> String {
    text.replace('\n', " ").trim().to_string()
}

/// Accumulates queued messages into a single delimited text frame.
#[derive(Debug, Default)]
pub struct Batch {
    buf: String,
    count: usize,
}

impl Batch {
    pub fn new(first: &str) -> Self {
        Self {
            buf: first.to_string(),
            count: 1,
        }
    }

    pub fn push(&mut self, next: &str) {
        self.buf.push(BATCH_DELIMITER);
        self.buf.push_str(next);
        self.count += 1;
    }

    /// Number of messages in the batch
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn into_frame(self) -> Frame {
        Frame::Text(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_inbound() {
        assert_eq!(normalize_inbound("  hello\nworld \n"), "hello world");
        assert_eq!(normalize_inbound("\n\n"), "");
        assert_eq!(normalize_inbound("plain"), "plain");
    }

    #[test]
    fn test_batch_joins_with_newline() {
        let mut batch = Batch::new("a");
        batch.push("b");
        batch.push("c");
        assert_eq!(batch.count(), 3);
        assert_eq!(batch.into_frame(), Frame::Text("a\nb\nc".to_string()));
    }
}
