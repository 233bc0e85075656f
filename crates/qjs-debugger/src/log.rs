use std::io::{self, Write};

use crossbeam_channel::{Receiver, Sender};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// `MakeWriter` that queues every formatted log record for the debugger
/// client instead of printing it.
///
/// The engine drains the queue into `output` events (see
/// [`Debugger::forward_logs`](crate::Debugger::forward_logs)).
#[derive(Debug, Clone)]
pub struct ClientLogWriter {
    sender: Sender<String>,
}

impl ClientLogWriter {
    pub fn new() -> (Self, Receiver<String>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { sender: tx }, rx)
    }
}

impl Write for ClientLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Nobody is draining the queue any more; dropping the record is fine.
        let _ = self
            .sender
            .send(String::from_utf8_lossy(buf).into_owned());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ClientLogWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Installs a global fmt subscriber that routes logs to the debugger client.
///
/// `filter` uses `EnvFilter` directive syntax; `RUST_LOG` takes precedence.
/// Returns `None` if a global subscriber is already set.
pub fn init_client_forwarding(filter: &str) -> Option<Receiver<String>> {
    let (writer, rx) = ClientLogWriter::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .ok()
        .map(|_| rx)
}
