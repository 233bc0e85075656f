use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info};

use crate::error::ConnectionError;
use crate::transport::TcpTransport;

/// Splits `host:port`. The host may not be empty; the port must fit in 16 bits.
pub fn parse_address(address: &str) -> Result<(&str, u16), ConnectionError> {
    let invalid = || ConnectionError::InvalidAddress(address.to_string());
    let (host, port) = address.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

fn resolve(address: &str) -> Result<Vec<SocketAddr>, ConnectionError> {
    let (host, port) = parse_address(address)?;
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| ConnectionError::Resolve {
            address: address.to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(ConnectionError::Resolve {
            address: address.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
        });
    }
    Ok(addrs)
}

/// Dials a debugger client listening at `address`.
pub fn connect(address: &str) -> Result<TcpTransport, ConnectionError> {
    let addrs = resolve(address)?;
    let stream = TcpStream::connect(&addrs[..]).map_err(|source| ConnectionError::Connect {
        address: address.to_string(),
        source,
    })?;
    info!(address, "Connected to debugger client");
    Ok(TcpTransport::new(stream))
}

/// A bound listening socket waiting for its single client.
#[derive(Debug)]
pub struct PendingConnection {
    listener: TcpListener,
}

impl PendingConnection {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Blocks until one client connects. The listening socket is closed
    /// before this returns, so later dials are refused.
    pub fn accept(self) -> Result<TcpTransport, ConnectionError> {
        let (stream, peer) = self.listener.accept().map_err(ConnectionError::Accept)?;
        drop(self.listener);
        info!(%peer, "Debugger client connected");
        Ok(TcpTransport::new(stream))
    }
}

pub fn bind(address: &str) -> Result<PendingConnection, ConnectionError> {
    let addrs = resolve(address)?;
    let listener = TcpListener::bind(&addrs[..]).map_err(|source| ConnectionError::Bind {
        address: address.to_string(),
        source,
    })?;
    debug!(address, local = ?listener.local_addr().ok(), "Waiting for debugger client");
    Ok(PendingConnection { listener })
}

/// Waits on `address` for exactly one debugger client.
pub fn listen(address: &str) -> Result<TcpTransport, ConnectionError> {
    bind(address)?.accept()
}
