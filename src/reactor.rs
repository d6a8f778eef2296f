//! Event reactor
//!
//! Nonblocking TCP front end for the control channel. The reactor accepts
//! connections, drains readable sockets into per-connection input buffers,
//! flushes output buffers when sockets become writable, and notifies an
//! [`EventHandler`] when a connection is actionable. Worker threads never
//! touch the sockets directly: they operate on the buffered [`ConnIo`]
//! handle and re-arm interest through the reactor's waker once they are
//! done with a connection.
//!
//! Interest is a cooperative contract rather than an epoll mask: sockets
//! stay registered for their whole life, and the `armed` flag decides
//! whether readiness is reported to the handler. A disarmed connection
//! keeps buffering; the backlog is reported when the owner re-arms.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

const EVENTS_CAPACITY: usize = 256;
/// Poll timeout; bounds how long a raised shutdown flag can go unnoticed.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Identity of one reactor connection, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) usize);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Callbacks the reactor drives. Implementations own all per-connection
/// state, keyed by [`ConnId`].
pub trait EventHandler: Send + Sync {
    /// A connection was accepted. `io` is the buffered handle the handler
    /// keeps for the connection's lifetime.
    fn on_accept(&self, io: ConnIo, peer: SocketAddr);
    /// Buffered input is waiting. Returning false closes the connection.
    fn on_readable(&self, id: ConnId) -> bool;
    /// The output buffer has drained and a resume was requested.
    /// Returning false closes the connection.
    fn on_writable(&self, id: ConnId) -> bool;
    /// The connection is gone; release all state for `id`.
    fn on_close(&self, id: ConnId);
}

struct ConnState {
    stream: TcpStream,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    /// Readiness is reported to the handler only while armed.
    armed: bool,
    /// Deliver a writable notification once the output buffer is empty.
    resume_hint: bool,
    eof: bool,
    broken: bool,
    close_requested: bool,
}

#[derive(Clone)]
struct Notifier {
    waker: Arc<Waker>,
    rearmed: Arc<Mutex<Vec<ConnId>>>,
}

impl Notifier {
    fn notify(&self, id: ConnId) {
        {
            let mut queue = self.rearmed.lock().unwrap();
            if !queue.contains(&id) {
                queue.push(id);
            }
        }
        if let Err(e) = self.waker.wake() {
            error!("reactor wake failed: {}", e);
        }
    }
}

/// Thread-safe buffered I/O handle for one connection.
#[derive(Clone)]
pub struct ConnIo {
    id: ConnId,
    state: Arc<Mutex<ConnState>>,
    notifier: Notifier,
}

impl ConnIo {
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Moves up to `buf.len()` buffered input bytes into `buf`.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock().unwrap();
        let n = buf.len().min(state.inbuf.len());
        buf[..n].copy_from_slice(&state.inbuf[..n]);
        state.inbuf.drain(..n);
        n
    }

    /// Appends `data` to the output buffer and flushes as much as the
    /// socket will take. Returns true when the buffer drained completely.
    pub fn write(&self, data: &[u8]) -> bool {
        let mut state = self.state.lock().unwrap();
        state.outbuf.extend_from_slice(data);
        flush_outbuf(&mut state)
    }

    /// Re-arms readiness reporting. With `resume` set the reactor delivers
    /// a writable notification once the output buffer is empty, which is
    /// how a suspended transfer gets driven forward.
    pub fn enable(&self, resume: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.armed = true;
            state.resume_hint = resume;
        }
        self.notifier.notify(self.id);
    }

    /// Stops readiness reporting while a worker owns the connection.
    pub fn disable(&self) {
        self.state.lock().unwrap().armed = false;
    }

    /// Asks the reactor to tear the connection down.
    pub fn request_close(&self) {
        self.state.lock().unwrap().close_requested = true;
        self.notifier.notify(self.id);
    }
}

fn flush_outbuf(state: &mut ConnState) -> bool {
    while !state.outbuf.is_empty() {
        match state.stream.write(&state.outbuf) {
            Ok(0) => {
                state.broken = true;
                return false;
            }
            Ok(n) => {
                state.outbuf.drain(..n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("control write failed: {}", e);
                state.broken = true;
                return false;
            }
        }
    }
    true
}

fn drain_into_inbuf(state: &mut ConnState) {
    let mut chunk = [0u8; 4096];
    loop {
        match state.stream.read(&mut chunk) {
            Ok(0) => {
                state.eof = true;
                break;
            }
            Ok(n) => state.inbuf.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("control read failed: {}", e);
                state.eof = true;
                break;
            }
        }
    }
}

struct Conn {
    io: ConnIo,
    peer: SocketAddr,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    conns: HashMap<Token, Conn>,
    next_token: usize,
    notifier: Notifier,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    /// Binds the control listener and prepares the poll loop. `shutdown`
    /// is checked between polls; raising it makes [`Reactor::run`] close
    /// every connection and return.
    pub fn new(addr: SocketAddr, shutdown: Arc<AtomicBool>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            conns: HashMap::new(),
            next_token: FIRST_CONNECTION,
            notifier: Notifier {
                waker,
                rearmed: Arc::new(Mutex::new(Vec::new())),
            },
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the event loop until the shutdown flag rises, then closes
    /// every live connection.
    pub fn run<H: EventHandler>(&mut self, handler: &H) -> io::Result<()> {
        info!("listening on {}", self.listener.local_addr()?);
        loop {
            let polled = self.poll.poll(&mut self.events, Some(POLL_INTERVAL));
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if let Err(e) = polled {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                match token {
                    LISTENER => self.accept_ready(handler),
                    WAKER => {}
                    token => self.conn_ready(handler, token, readable, writable),
                }
            }

            let rearmed = std::mem::take(&mut *self.notifier.rearmed.lock().unwrap());
            for id in rearmed {
                self.conn_rearmed(handler, id);
            }
        }

        info!("shutting down, closing {} connection(s)", self.conns.len());
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.close(handler, token);
        }
        Ok(())
    }

    fn accept_ready<H: EventHandler>(&mut self, handler: &H) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        error!("failed to register connection from {}: {}", peer, e);
                        continue;
                    }
                    info!("connection accepted from {}", peer);
                    let io = ConnIo {
                        id: ConnId(token.0),
                        state: Arc::new(Mutex::new(ConnState {
                            stream,
                            inbuf: Vec::new(),
                            outbuf: Vec::new(),
                            armed: true,
                            resume_hint: false,
                            eof: false,
                            broken: false,
                            close_requested: false,
                        })),
                        notifier: self.notifier.clone(),
                    };
                    self.conns.insert(token, Conn { io: io.clone(), peer });
                    handler.on_accept(io, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn conn_ready<H: EventHandler>(
        &mut self,
        handler: &H,
        token: Token,
        readable: bool,
        writable: bool,
    ) {
        let Some(conn) = self.conns.get(&token) else {
            return;
        };
        let io = conn.io.clone();

        let mut should_close = false;
        let mut notify_read = false;
        let mut notify_write = false;
        {
            let mut state = io.state.lock().unwrap();
            if readable {
                drain_into_inbuf(&mut state);
            }
            if writable && !state.outbuf.is_empty() {
                flush_outbuf(&mut state);
            }
            if state.close_requested || state.broken || state.eof {
                should_close = true;
            } else if state.armed {
                if readable && !state.inbuf.is_empty() {
                    notify_read = true;
                } else if writable && state.outbuf.is_empty() && state.resume_hint {
                    state.resume_hint = false;
                    notify_write = true;
                }
            }
        }

        if should_close {
            self.close(handler, token);
        } else if notify_read {
            if !handler.on_readable(io.id()) {
                self.close(handler, token);
            }
        } else if notify_write {
            if !handler.on_writable(io.id()) {
                self.close(handler, token);
            }
        }
    }

    /// Re-evaluates a connection a worker just handed back: pending input
    /// is reported immediately, a requested resume fires as soon as the
    /// output buffer is empty, and deferred closes are honored.
    fn conn_rearmed<H: EventHandler>(&mut self, handler: &H, id: ConnId) {
        let token = Token(id.0);
        let Some(conn) = self.conns.get(&token) else {
            return;
        };
        let io = conn.io.clone();

        let mut should_close = false;
        let mut notify_read = false;
        let mut notify_write = false;
        {
            let mut state = io.state.lock().unwrap();
            if state.close_requested || state.broken || state.eof {
                should_close = true;
            } else if state.armed {
                if !state.inbuf.is_empty() {
                    notify_read = true;
                } else if !state.outbuf.is_empty() {
                    // A writable edge will finish the flush; the resume
                    // hint stays set until the buffer drains.
                } else if state.resume_hint {
                    state.resume_hint = false;
                    notify_write = true;
                }
            }
        }

        if should_close {
            self.close(handler, token);
        } else if notify_read {
            if !handler.on_readable(id) {
                self.close(handler, token);
            }
        } else if notify_write {
            if !handler.on_writable(id) {
                self.close(handler, token);
            }
        }
    }

    fn close<H: EventHandler>(&mut self, handler: &H, token: Token) {
        let Some(conn) = self.conns.remove(&token) else {
            return;
        };
        info!("connection from {} closed", conn.peer);
        handler.on_close(ConnId(token.0));
        let mut state = conn.io.state.lock().unwrap();
        if let Err(e) = self.poll.registry().deregister(&mut state.stream) {
            debug!("deregister failed: {}", e);
        }
    }
}
