use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::error::TransportError;

const PIPE_CHUNK: usize = 4096;

/// Result of a non-blocking look at the incoming side of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peek {
    NoData,
    HasData,
}

/// Byte stream between the engine and a debugger client.
///
/// `read` and `write` may block. `peek` must never block. `close` may be
/// called any number of times; every call after the first is a no-op.
pub trait Transport: Send {
    /// Reads at least one byte into `buf`.
    ///
    /// An orderly shutdown by the peer is reported as [`TransportError::Closed`],
    /// never as `Ok(0)`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    fn peek(&mut self) -> Result<Peek, TransportError>;

    fn close(&mut self);

    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(TransportError::Closed),
                written => buf = &buf[written..],
            }
        }
        Ok(())
    }
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Transport")
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        (**self).write(buf)
    }

    fn peek(&mut self) -> Result<Peek, TransportError> {
        (**self).peek()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Socket-backed transport.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to disable Nagle on debugger socket");
        }
        Self {
            stream: Some(stream),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::InvalidHandle)
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let stream = self.stream()?;
        if buf.is_empty() {
            return Err(TransportError::ZeroLength);
        }
        loop {
            match stream.read(buf) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream()?;
        if buf.is_empty() {
            return Err(TransportError::ZeroLength);
        }
        loop {
            match stream.write(buf) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn peek(&mut self) -> Result<Peek, TransportError> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        let result = stream.peek(&mut byte);
        stream.set_nonblocking(false)?;

        match result {
            Ok(0) => Err(TransportError::Closed),
            Ok(_) => Ok(Peek::HasData),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(Peek::NoData)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Incoming half shared by the queue-backed transports.
struct ChunkReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl ChunkReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }

    fn has_pending(&self) -> bool {
        self.offset < self.pending.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        while !self.has_pending() {
            self.pending = self.rx.recv().map_err(|_| TransportError::Closed)?;
            self.offset = 0;
        }
        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }

    fn peek(&mut self) -> Result<Peek, TransportError> {
        while !self.has_pending() {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(TryRecvError::Empty) => return Ok(Peek::NoData),
                Err(TryRecvError::Disconnected) => return Err(TransportError::Closed),
            }
        }
        Ok(Peek::HasData)
    }
}

/// In-process transport; one end of a connected pair.
///
/// Closing one end makes reads on the other end report
/// [`TransportError::Closed`] once the queued bytes are drained.
pub struct MemoryTransport {
    reader: ChunkReader,
    tx: Option<Sender<Vec<u8>>>,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("open", &self.tx.is_some())
            .field("buffered", &(self.reader.pending.len() - self.reader.offset))
            .finish()
    }
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = crossbeam_channel::unbounded();
        let (b_tx, b_rx) = crossbeam_channel::unbounded();
        (
            MemoryTransport {
                reader: ChunkReader::new(b_rx),
                tx: Some(a_tx),
            },
            MemoryTransport {
                reader: ChunkReader::new(a_rx),
                tx: Some(b_tx),
            },
        )
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::InvalidHandle);
        }
        if buf.is_empty() {
            return Err(TransportError::ZeroLength);
        }
        self.reader.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::InvalidHandle)?;
        if buf.is_empty() {
            return Err(TransportError::ZeroLength);
        }
        tx.send(buf.to_vec()).map_err(|_| TransportError::Closed)?;
        Ok(buf.len())
    }

    fn peek(&mut self) -> Result<Peek, TransportError> {
        if self.is_closed() {
            return Err(TransportError::InvalidHandle);
        }
        self.reader.peek()
    }

    fn close(&mut self) {
        self.tx = None;
    }
}

/// Transport over an arbitrary reader/writer pair, e.g. stdin and stdout.
///
/// A named thread pumps the reader into a queue so that `peek` stays
/// non-blocking; only raw bytes cross threads.
pub struct PipeTransport {
    reader: ChunkReader,
    writer: Option<Box<dyn Write + Send>>,
}

impl fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeTransport")
            .field("open", &self.writer.is_some())
            .finish()
    }
}

impl PipeTransport {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        if let Err(e) = thread::Builder::new()
            .name("qjs-debugger-pipe".to_string())
            .spawn(move || pump(reader, tx))
        {
            // Without a pump the queue has no sender and every read reports Closed.
            warn!(error = %e, "Failed to spawn pipe reader thread");
        }

        Self {
            reader: ChunkReader::new(rx),
            writer: Some(Box::new(writer)),
        }
    }

    pub fn stdio() -> Self {
        Self::new(io::stdin(), io::stdout())
    }
}

fn pump<R: Read>(mut reader: R, tx: Sender<Vec<u8>>) {
    let mut buf = [0u8; PIPE_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Pipe reader stopped");
                break;
            }
        }
    }
    debug!("Pipe reader finished");
}

impl Transport for PipeTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.writer.is_none() {
            return Err(TransportError::InvalidHandle);
        }
        if buf.is_empty() {
            return Err(TransportError::ZeroLength);
        }
        self.reader.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::InvalidHandle)?;
        if buf.is_empty() {
            return Err(TransportError::ZeroLength);
        }
        let n = writer.write(buf)?;
        writer.flush()?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        Ok(n)
    }

    fn peek(&mut self) -> Result<Peek, TransportError> {
        if self.writer.is_none() {
            return Err(TransportError::InvalidHandle);
        }
        self.reader.peek()
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }
}
