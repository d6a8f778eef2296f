//! Server assembly
//!
//! The owned `Server` value ties the pieces together: configuration, the
//! reactor, the worker pool, and the registry mapping reactor connections
//! to sessions. `FtpService` is the reactor-facing glue; it follows the
//! disarm-before-submit discipline so that at most one worker ever touches
//! a session, and re-arms interest when the pool refuses a task so the
//! event is redelivered instead of lost.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use log::info;
use signal_hook::consts::{SIGINT, SIGPIPE, SIGTERM};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::pool::{Task, WorkerPool};
use crate::reactor::{ConnId, ConnIo, EventHandler, Reactor};
use crate::session::{Session, SessionHandle};

const TASK_QUEUE_LIMIT: usize = 10_000;
const WORKER_THREADS: usize = 6;

enum FtpTask {
    Accept(Arc<SessionHandle>),
    Read(Arc<SessionHandle>),
    Write(Arc<SessionHandle>),
}

impl Task for FtpTask {
    fn execute(self) {
        match self {
            FtpTask::Accept(session) => session.handle_accept(),
            FtpTask::Read(session) => session.handle_read(),
            FtpTask::Write(session) => session.handle_write(),
        }
    }
}

struct FtpService {
    config: Arc<ServerConfig>,
    pool: WorkerPool<FtpTask>,
    sessions: Mutex<HashMap<ConnId, Arc<SessionHandle>>>,
}

impl FtpService {
    fn session(&self, id: ConnId) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Disarm, then queue. A refused task hands the session straight back
    /// so the reactor redelivers the event later. Returns false only when
    /// the session is already in error and must be closed.
    fn queue(&self, session: &Arc<SessionHandle>, make: fn(Arc<SessionHandle>) -> FtpTask) -> bool {
        if !session.mark_busy() {
            return false;
        }
        if !self.pool.submit(make(Arc::clone(session))) {
            session.release();
        }
        true
    }
}

impl EventHandler for FtpService {
    fn on_accept(&self, io: ConnIo, peer: SocketAddr) {
        let id = io.id();
        let session = SessionHandle::new(Session::new(io, peer, Arc::clone(&self.config)));
        self.sessions.lock().unwrap().insert(id, Arc::clone(&session));
        self.queue(&session, FtpTask::Accept);
    }

    fn on_readable(&self, id: ConnId) -> bool {
        match self.session(id) {
            Some(session) => self.queue(&session, FtpTask::Read),
            None => false,
        }
    }

    fn on_writable(&self, id: ConnId) -> bool {
        match self.session(id) {
            Some(session) => self.queue(&session, FtpTask::Write),
            None => false,
        }
    }

    fn on_close(&self, id: ConnId) {
        let Some(session) = self.sessions.lock().unwrap().remove(&id) else {
            return;
        };
        session.close();
    }
}

pub struct Server {
    config: Arc<ServerConfig>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the event loop when raised; shared with signal
    /// handlers and tests.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Installs SIGINT/SIGTERM shutdown handling and suppresses SIGPIPE so
    /// writes to dead sockets surface as I/O errors.
    pub fn register_signals(&self) -> std::io::Result<()> {
        signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown))?;
        signal_hook::flag::register(SIGPIPE, Arc::new(AtomicBool::new(false)))?;
        Ok(())
    }

    /// Binds the control listener and serves until the shutdown flag
    /// rises. Every live session is closed before returning.
    pub fn run(&self) -> Result<(), ServerError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));
        let mut reactor =
            Reactor::new(addr, Arc::clone(&self.shutdown)).map_err(ServerError::Bind)?;
        let service = FtpService {
            config: Arc::clone(&self.config),
            pool: WorkerPool::new(TASK_QUEUE_LIMIT, WORKER_THREADS),
            sessions: Mutex::new(HashMap::new()),
        };

        info!("server ready on port {}", self.config.port);
        let result = reactor.run(&service).map_err(ServerError::Reactor);
        service.pool.shutdown();
        info!("server stopped");
        result
    }
}
