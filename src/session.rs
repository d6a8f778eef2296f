//! Session state and event orchestration
//!
//! One `Session` per control connection, owned by a [`SessionHandle`] that
//! serializes worker access and lets the reactor wait for an in-flight
//! worker before destroying the session. The handle methods mirror the
//! reactor task types: accept greets, read drains/parses/flushes, write
//! resumes a pending transfer and flushes. Every task ends by marking the
//! session idle and re-arming reactor interest.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use log::warn;

use crate::config::ServerConfig;
use crate::data_channel::DataChannel;
use crate::encoding;
use crate::handlers;
use crate::reactor::ConnIo;
use crate::transfer::{Transfer, TransferKind, TransferStep};

/// Parse-buffer bytes allowed to remain after a dispatch batch; more is a
/// protocol error that ends the session.
pub const MAX_RESIDUAL: usize = 1024;

const READ_SLICE: usize = 1024;

pub struct Session {
    io: ConnIo,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    user: String,
    authenticated: bool,
    utf8_mode: bool,
    current_dir: Vec<u8>,
    rename_from: Option<Vec<u8>>,
    data: DataChannel,
    parse_buffer: Vec<u8>,
    send_buffer: Vec<u8>,
    transfer: Option<Transfer>,
    io_idle: bool,
    error_flag: bool,
}

impl Session {
    pub fn new(io: ConnIo, peer: SocketAddr, config: Arc<ServerConfig>) -> Self {
        Self {
            io,
            peer,
            current_dir: config.root_dir.clone().into_bytes(),
            config,
            user: String::new(),
            authenticated: false,
            utf8_mode: false,
            rename_from: None,
            data: DataChannel::new(),
            parse_buffer: Vec::new(),
            send_buffer: Vec::new(),
            transfer: None,
            io_idle: true,
            error_flag: false,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn set_user(&mut self, user: String) {
        self.user = user;
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_authenticated(&mut self, value: bool) {
        self.authenticated = value;
    }

    pub fn utf8_mode(&self) -> bool {
        self.utf8_mode
    }

    pub fn set_utf8_mode(&mut self, value: bool) {
        self.utf8_mode = value;
    }

    pub fn current_dir(&self) -> &[u8] {
        &self.current_dir
    }

    pub fn set_current_dir(&mut self, dir: Vec<u8>) {
        self.current_dir = dir;
    }

    pub fn current_dir_path(&self) -> PathBuf {
        PathBuf::from(OsString::from_vec(self.current_dir.clone()))
    }

    pub fn set_rename_from(&mut self, path: Vec<u8>) {
        self.rename_from = Some(path);
    }

    /// Clears the pending rename source either way, per the RNTO contract.
    pub fn take_rename_from(&mut self) -> Option<Vec<u8>> {
        self.rename_from.take()
    }

    pub fn data_channel(&self) -> &DataChannel {
        &self.data
    }

    pub fn data_channel_mut(&mut self) -> &mut DataChannel {
        &mut self.data
    }

    pub fn error_flag(&self) -> bool {
        self.error_flag
    }

    pub(crate) fn parse_buffer(&self) -> &[u8] {
        &self.parse_buffer
    }

    pub(crate) fn consume_parsed(&mut self, n: usize) {
        self.parse_buffer.drain(..n);
    }

    /// Queues a reply on the control channel.
    pub fn push_response(&mut self, bytes: &[u8]) {
        self.send_buffer.extend_from_slice(bytes);
    }

    /// Translates a client parameter from the wire encoding to the system
    /// encoding when the session negotiated UTF-8.
    pub fn decode_param(&self, param: &[u8]) -> Vec<u8> {
        if self.utf8_mode {
            encoding::convert(param, "UTF-8", &self.config.system_encoding)
        } else {
            param.to_vec()
        }
    }

    /// Translates a path-echoing reply to the wire encoding.
    pub fn encode_reply(&self, reply: Vec<u8>) -> Vec<u8> {
        if self.utf8_mode {
            encoding::convert(&reply, &self.config.system_encoding, "UTF-8")
        } else {
            reply
        }
    }

    /// Pushes queued replies toward the client. Returns true when the
    /// reactor wrote everything to the socket; false means bytes are still
    /// buffered and a writable event will finish the job.
    pub fn flush(&mut self) -> bool {
        if self.send_buffer.is_empty() {
            return self.io.write(&[]);
        }
        let pending = std::mem::take(&mut self.send_buffer);
        self.io.write(&pending)
    }

    /// Starts a transfer and drives it to its first suspension. Returns
    /// true when it completed synchronously.
    pub fn start_transfer(&mut self, kind: TransferKind) -> bool {
        let mut transfer = Transfer::new(kind);
        match transfer.resume(self) {
            TransferStep::Suspended => {
                self.transfer = Some(transfer);
                false
            }
            TransferStep::Completed => true,
        }
    }

    fn drain_input(&mut self) {
        let mut slice = [0u8; READ_SLICE];
        loop {
            let n = self.io.read(&mut slice);
            if n == 0 {
                break;
            }
            self.parse_buffer.extend_from_slice(&slice[..n]);
            if n < READ_SLICE {
                break;
            }
        }
    }

    /// Resumes a pending transfer if any. Returns true when the session is
    /// free to dispatch commands again.
    fn resume_transfer(&mut self) -> bool {
        let Some(mut transfer) = self.transfer.take() else {
            return true;
        };
        match transfer.resume(self) {
            TransferStep::Suspended => {
                self.transfer = Some(transfer);
                false
            }
            TransferStep::Completed => true,
        }
    }
}

/// Shared session wrapper: the mutex serializes the single worker the
/// reactor dispatches at a time, and the condvar lets the close path wait
/// for that worker instead of spinning.
pub struct SessionHandle {
    state: Mutex<Session>,
    idle: Condvar,
}

impl SessionHandle {
    pub fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(session),
            idle: Condvar::new(),
        })
    }

    /// Reactor-side: mark the session busy and disarm interest before a
    /// task is queued. Returns false when the session is already in error,
    /// in which case the caller should close it.
    pub fn mark_busy(&self) -> bool {
        let mut session = self.state.lock().unwrap();
        if session.error_flag {
            return false;
        }
        session.io_idle = false;
        session.io.disable();
        true
    }

    /// Reactor-side: task submission failed, hand the session back so the
    /// event is redelivered later.
    pub fn release(&self) {
        let session = self.state.lock().unwrap();
        self.finish(session);
    }

    /// ACCEPT task: greet the client.
    pub fn handle_accept(&self) {
        let mut session = self.state.lock().unwrap();
        session.push_response(b"220 Welcome\r\n");
        session.flush();
        self.finish(session);
    }

    /// READ task: drain new input, drive any pending transfer, then parse
    /// and dispatch queued commands.
    pub fn handle_read(&self) {
        let mut session = self.state.lock().unwrap();
        if session.error_flag {
            self.finish(session);
            return;
        }
        session.drain_input();
        if session.resume_transfer() {
            handlers::parse_and_dispatch(&mut session);
            if session.parse_buffer.len() > MAX_RESIDUAL {
                warn!("{} protocol error: parse buffer overflow", session.peer);
                session.error_flag = true;
            }
        }
        session.flush();
        if session.error_flag {
            session.io.request_close();
        }
        self.finish(session);
    }

    /// WRITE task: drive any pending transfer; no parsing.
    pub fn handle_write(&self) {
        let mut session = self.state.lock().unwrap();
        if session.error_flag {
            self.finish(session);
            return;
        }
        session.resume_transfer();
        session.flush();
        self.finish(session);
    }

    /// Reactor-side close: flag the error, wait for any in-flight worker,
    /// then force one resumption of a pending transfer so it releases its
    /// descriptors.
    pub fn close(&self) {
        let mut session = self.state.lock().unwrap();
        session.error_flag = true;
        while !session.io_idle {
            session = self.idle.wait(session).unwrap();
        }
        if let Some(mut transfer) = session.transfer.take() {
            transfer.resume(&mut session);
        }
        session.data.close();
    }

    /// Ends a task: the session goes idle, close waiters wake, and
    /// reactor interest is re-armed (with a resume request when a transfer
    /// is still pending). Errored sessions stay disarmed.
    fn finish(&self, session: MutexGuard<'_, Session>) {
        let mut session = session;
        session.io_idle = true;
        let error = session.error_flag;
        let resume = session.transfer.is_some();
        let io = session.io.clone();
        drop(session);
        self.idle.notify_all();
        if !error {
            io.enable(resume);
        }
    }
}

/// Composes a filesystem path by byte concatenation, the way the protocol
/// handlers build every target: `dir + "/" + name`, no normalization.
pub fn compose_path(dir: &[u8], name: &[u8]) -> PathBuf {
    let mut bytes = Vec::with_capacity(dir.len() + 1 + name.len());
    bytes.extend_from_slice(dir);
    bytes.push(b'/');
    bytes.extend_from_slice(name);
    PathBuf::from(OsString::from_vec(bytes))
}
