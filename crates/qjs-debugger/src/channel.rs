use tracing::trace;

use crate::error::{ChannelError, ProtocolError};
use crate::protocol::Message;
use crate::transport::{Peek, Transport};

const READ_CHUNK: usize = 4096;
const DELIMITER: u8 = b'\n';
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Frames [`Message`]s on top of a [`Transport`].
///
/// Each message is one compact JSON object followed by `\n`. Partial reads
/// are buffered until a whole line is available. A line longer than the
/// message limit is dropped with [`ProtocolError::TooLarge`] and its
/// remaining bytes are discarded up to the next line break.
#[derive(Debug)]
pub struct MessageChannel<T: Transport> {
    transport: T,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no delimiter.
    scanned: usize,
    discarding: bool,
    max_message_len: usize,
}

impl<T: Transport> MessageChannel<T> {
    pub fn new(transport: T) -> Self {
        Self::with_max_message_len(transport, DEFAULT_MAX_MESSAGE_LEN)
    }

    pub fn with_max_message_len(transport: T, max_message_len: usize) -> Self {
        Self {
            transport,
            buffer: Vec::new(),
            scanned: 0,
            discarding: false,
            max_message_len,
        }
    }

    /// Serializes `message` and writes it fully, or fails.
    pub fn try_send(&mut self, message: &Message) -> Result<(), ChannelError> {
        let mut bytes = serde_json::to_vec(message).map_err(ProtocolError::Malformed)?;
        bytes.push(DELIMITER);
        self.transport.write_all(&bytes)?;
        Ok(())
    }

    /// Reads until one full message is decoded.
    pub fn blocking_receive(&mut self) -> Result<Message, ChannelError> {
        loop {
            if let Some(decoded) = self.decode_front() {
                return Ok(decoded?);
            }
            self.fill()?;
        }
    }

    /// Returns a message only if one can be assembled without blocking.
    pub fn poll_receive(&mut self) -> Result<Option<Message>, ChannelError> {
        loop {
            if let Some(decoded) = self.decode_front() {
                return Ok(Some(decoded?));
            }
            match self.transport.peek()? {
                Peek::NoData => return Ok(None),
                Peek::HasData => self.fill()?,
            }
        }
    }

    pub fn close(&mut self) {
        self.transport.close();
        self.buffer.clear();
        self.scanned = 0;
        self.discarding = false;
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Bytes received but not yet consumed by a decoded message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn fill(&mut self) -> Result<(), ChannelError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.transport.read(&mut chunk)?;
        trace!(bytes = n, "Read from transport");
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Consumes the first complete line, if any. Blank lines are skipped.
    fn decode_front(&mut self) -> Option<Result<Message, ProtocolError>> {
        loop {
            let Some(pos) = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == DELIMITER)
            else {
                return self.check_pending_len();
            };
            let end = self.scanned + pos;
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;

            if std::mem::take(&mut self.discarding) {
                trace!(bytes = line.len(), "Discarded tail of oversized message");
                continue;
            }
            let line = &line[..end];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(serde_json::from_slice(line).map_err(ProtocolError::Malformed));
        }
    }

    /// Remembers the scanned prefix and drops an unterminated line that has
    /// outgrown the message limit.
    fn check_pending_len(&mut self) -> Option<Result<Message, ProtocolError>> {
        self.scanned = self.buffer.len();
        if self.buffer.len() <= self.max_message_len {
            return None;
        }

        self.buffer.clear();
        self.scanned = 0;
        if self.discarding {
            return None;
        }
        self.discarding = true;
        Some(Err(ProtocolError::TooLarge(self.max_message_len)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::TransportError;
    use crate::protocol::{ContinuedEvent, Event, Request};
    use crate::transport::MemoryTransport;

    fn channel_pair() -> (MessageChannel<MemoryTransport>, MessageChannel<MemoryTransport>) {
        let (a, b) = MemoryTransport::pair();
        (MessageChannel::new(a), MessageChannel::new(b))
    }

    #[test]
    fn test_send_and_receive() {
        let (mut client, mut engine) = channel_pair();
        let request = Message::Request(Request::new(1, "continue", None));
        client.try_send(&request).unwrap();
        assert_eq!(engine.blocking_receive().unwrap(), request);
    }

    #[test]
    fn test_message_split_across_reads() {
        let (mut raw, engine) = MemoryTransport::pair();
        let mut engine = MessageChannel::new(engine);

        raw.write_all(br#"{"type":"request","seq":1,"#).unwrap();
        assert!(engine.poll_receive().unwrap().is_none());
        assert!(engine.buffered() > 0);

        raw.write_all(b"\"command\":\"pause\"}\n").unwrap();
        assert_eq!(
            engine.poll_receive().unwrap(),
            Some(Message::Request(Request::new(1, "pause", None)))
        );
        assert_eq!(engine.buffered(), 0);
    }

    #[test]
    fn test_two_messages_in_one_read() {
        let (mut raw, engine) = MemoryTransport::pair();
        let mut engine = MessageChannel::new(engine);

        raw.write_all(
            b"{\"type\":\"request\",\"seq\":1,\"command\":\"next\"}\n\n{\"type\":\"request\",\"seq\":2,\"command\":\"stepIn\"}\n",
        )
        .unwrap();

        assert_eq!(
            engine.blocking_receive().unwrap(),
            Message::Request(Request::new(1, "next", None))
        );
        assert_eq!(
            engine.blocking_receive().unwrap(),
            Message::Request(Request::new(2, "stepIn", None))
        );
        assert!(engine.poll_receive().unwrap().is_none());
    }

    #[test]
    fn test_malformed_line_is_consumed() {
        let (mut raw, engine) = MemoryTransport::pair();
        let mut engine = MessageChannel::new(engine);

        raw.write_all(b"{not json}\n{\"type\":\"request\",\"seq\":3,\"command\":\"continue\"}\n")
            .unwrap();

        assert!(matches!(
            engine.blocking_receive(),
            Err(ChannelError::Protocol(ProtocolError::Malformed(_)))
        ));
        assert_eq!(
            engine.blocking_receive().unwrap(),
            Message::Request(Request::new(3, "continue", None))
        );
    }

    #[test]
    fn test_oversized_message_is_dropped() {
        let (mut raw, engine) = MemoryTransport::pair();
        let mut engine = MessageChannel::with_max_message_len(engine, 32);

        raw.write_all(&[b'x'; 40]).unwrap();
        assert!(matches!(
            engine.poll_receive(),
            Err(ChannelError::Protocol(ProtocolError::TooLarge(32)))
        ));
        assert_eq!(engine.buffered(), 0);

        raw.write_all(&[b'y'; 40]).unwrap();
        assert!(engine.poll_receive().unwrap().is_none());
        assert_eq!(engine.buffered(), 0);

        raw.write_all(b"zz}\n{\"type\":\"request\",\"seq\":4,\"command\":\"next\"}\n")
            .unwrap();
        assert_eq!(
            engine.blocking_receive().unwrap(),
            Message::Request(Request::new(4, "next", None))
        );
    }

    #[test]
    fn test_message_assembled_from_many_reads() {
        let (mut raw, engine) = MemoryTransport::pair();
        let mut engine = MessageChannel::new(engine);
        let message = Message::Request(Request::new(
            9,
            "evaluate",
            Some(json!({ "frameIndex": 0, "expression": "a".repeat(3 * READ_CHUNK) })),
        ));
        let mut bytes = serde_json::to_vec(&message).unwrap();
        bytes.push(DELIMITER);

        for chunk in bytes.chunks(1000) {
            assert!(engine.poll_receive().unwrap().is_none());
            raw.write_all(chunk).unwrap();
        }
        assert_eq!(engine.poll_receive().unwrap(), Some(message));
        assert_eq!(engine.buffered(), 0);
    }

    #[test]
    fn test_poll_without_data_returns_none() {
        let (_client, mut engine) = channel_pair();
        assert!(engine.poll_receive().unwrap().is_none());
    }

    #[test]
    fn test_closed_peer_is_fatal() {
        let (mut client, mut engine) = channel_pair();
        client.close();
        let err = engine.blocking_receive().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::Closed)
        ));
    }

    #[test]
    fn test_encoding_is_newline_delimited() {
        let (engine, mut raw) = MemoryTransport::pair();
        let mut channel = MessageChannel::new(engine);
        channel
            .try_send(&Message::Event(Event::Continued(ContinuedEvent {})))
            .unwrap();

        let mut buf = [0u8; 128];
        let n = raw.read(&mut buf).unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(text.trim_end()).unwrap(),
            json!({"type": "event", "event": "continued", "body": {}})
        );
    }
}
