use tracing::{error, warn};

use crate::channel::MessageChannel;
use crate::error::{ChannelError, ProtocolError, TransportError};
use crate::protocol::{Event, Message, Request, Response};
use crate::transport::Transport;

/// State of one attached debugger client.
#[derive(Debug)]
pub(crate) struct Session {
    channel: MessageChannel<Box<dyn Transport>>,
    pub(crate) paused: bool,
    pub(crate) exception_breakpoints: bool,
    peek_ticks: u32,
}

impl Session {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        exception_breakpoints: bool,
        peek_interval: u32,
    ) -> Self {
        Self {
            channel: MessageChannel::new(transport),
            paused: false,
            exception_breakpoints,
            peek_ticks: peek_interval,
        }
    }

    /// Counts down one `cooperate` tick. Returns `true` and rearms the
    /// counter when a poll is due.
    pub(crate) fn tick(&mut self, interval: u32) -> bool {
        self.peek_ticks = self.peek_ticks.saturating_sub(1);
        if self.peek_ticks == 0 {
            self.peek_ticks = interval;
            true
        } else {
            false
        }
    }

    /// Sends `message`. Only transport failures are returned; they end the session.
    pub(crate) fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        match self.channel.try_send(message) {
            Ok(()) => Ok(()),
            Err(ChannelError::Transport(e)) => Err(e),
            Err(ChannelError::Protocol(e)) => {
                error!(error = %e, kind = message.kind(), "Failed to encode outgoing message");
                Ok(())
            }
        }
    }

    pub(crate) fn send_event(&mut self, event: Event) -> Result<(), TransportError> {
        self.send(&Message::Event(event))
    }

    pub(crate) fn respond(&mut self, response: Response) -> Result<(), TransportError> {
        self.send(&Message::Response(response))
    }

    pub(crate) fn receive_request(&mut self) -> Result<Request, ChannelError> {
        self.channel.blocking_receive().and_then(into_request)
    }

    pub(crate) fn poll_request(&mut self) -> Result<Option<Request>, ChannelError> {
        self.channel.poll_receive()?.map(into_request).transpose()
    }

    /// Answers an undecodable or stray message with an error response.
    pub(crate) fn reject(&mut self, error: &ProtocolError) -> Result<(), TransportError> {
        warn!(error = %error, "Ignoring bad message from client");
        self.respond(Response::error(0, error.to_string()))
    }

    pub(crate) fn close(&mut self) {
        self.channel.close();
    }
}

fn into_request(message: Message) -> Result<Request, ChannelError> {
    match message {
        Message::Request(request) => Ok(request),
        other => Err(ProtocolError::UnexpectedMessage(other.kind()).into()),
    }
}
