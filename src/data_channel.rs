//! Data channel management
//!
//! Tracks the per-session data connection negotiated with PORT or PASV and
//! establishes it on demand when a transfer starts. The passive listener is
//! accepted against a deadline by polling in non-blocking mode; active mode
//! uses a bounded connect. Whatever the outcome, a finished transfer tears
//! both sockets down.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use socket2::{Domain, Socket, Type};

const ACCEPT_POLL_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    None,
    Active,
    Passive,
}

pub struct DataChannel {
    mode: DataMode,
    active_target: Option<SocketAddrV4>,
    listener: Option<TcpListener>,
    socket: Option<TcpStream>,
}

impl DataChannel {
    pub fn new() -> Self {
        Self {
            mode: DataMode::None,
            active_target: None,
            listener: None,
            socket: None,
        }
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    /// Records the client-supplied target for active mode. Any previous
    /// data socket is dropped; no connection is made yet.
    pub fn set_active(&mut self, target: SocketAddrV4) {
        self.socket = None;
        self.active_target = Some(target);
        self.mode = DataMode::Active;
    }

    /// Opens the passive listener on an ephemeral port and returns that
    /// port. Any previous data socket is dropped.
    pub fn set_passive(&mut self) -> io::Result<u16> {
        self.socket = None;
        let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        socket.bind(&any.into())?;
        socket.listen(1)?;
        let listener: TcpListener = socket.into();
        let port = listener.local_addr()?.port();
        self.listener = Some(listener);
        self.mode = DataMode::Passive;
        Ok(port)
    }

    /// Establishes the data connection for the current mode. Passive mode
    /// accepts one connection within `timeout` and closes the listener
    /// either way; active mode connects to the recorded target. The
    /// resulting socket carries `timeout` as its read and write timeout.
    pub fn establish(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.mode {
            DataMode::Passive => {
                let listener = self.listener.take().ok_or_else(not_configured)?;
                let stream = accept_with_deadline(&listener, timeout)?;
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)?;
                self.socket = Some(stream);
            }
            DataMode::Active => {
                let target = self.active_target.ok_or_else(not_configured)?;
                let addr = SocketAddr::from(target);
                let stream = match timeout {
                    Some(limit) => TcpStream::connect_timeout(&addr, limit)?,
                    None => TcpStream::connect(addr)?,
                };
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)?;
                self.socket = Some(stream);
            }
            DataMode::None => return Err(not_configured()),
        }
        Ok(())
    }

    pub fn socket(&self) -> Option<&TcpStream> {
        self.socket.as_ref()
    }

    /// Drops the data socket and any pending listener.
    pub fn close(&mut self) {
        self.socket = None;
        self.listener = None;
    }
}

impl Default for DataChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn not_configured() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "no data connection configured")
}

fn accept_with_deadline(
    listener: &TcpListener,
    timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    listener.set_nonblocking(true)?;
    let deadline = timeout.map(|limit| Instant::now() + limit);
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("data connection accepted from {}", peer);
                return Ok(stream);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "timed out waiting for data connection",
                        ));
                    }
                }
                thread::sleep(Duration::from_millis(ACCEPT_POLL_MS));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Parses `h1,h2,h3,h4,p1,p2` from a PORT argument. All six fields must be
/// decimal bytes.
pub fn parse_port_param(param: &str) -> Option<SocketAddrV4> {
    let mut fields = [0u8; 6];
    let mut count = 0;
    for part in param.split(',') {
        if count == 6 {
            return None;
        }
        fields[count] = part.trim().parse().ok()?;
        count += 1;
    }
    if count != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(fields[0], fields[1], fields[2], fields[3]);
    let port = u16::from(fields[4]) * 256 + u16::from(fields[5]);
    Some(SocketAddrV4::new(ip, port))
}
