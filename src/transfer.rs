//! Suspendable transfers
//!
//! LIST/NLST, RETR and STOR run as explicit state machines owned by the
//! session. A transfer suspends when the control channel still has
//! unflushed response bytes, or when the data socket reports a timeout,
//! and is resumed by the next control-channel event. Observing the session
//! error flag on resume releases every owned descriptor and completes
//! without further output.

use std::fs::{File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};

use chrono::{Local, TimeZone};
use log::debug;

use crate::encoding;
use crate::session::{compose_path, Session};

const CHUNK_SIZE: usize = 8192;

/// Outcome of one resumption, as seen by the session.
pub enum TransferStep {
    Suspended,
    Completed,
}

pub enum TransferKind {
    List,
    /// RETR; the parameter is the file name in the system encoding.
    Retrieve(Vec<u8>),
    /// STOR; client-supplied directory components are stripped.
    Store(Vec<u8>),
}

enum TransferState {
    Start,
    /// The 150 reply is queued; waiting for the control channel to drain
    /// before touching the data socket.
    FlushPreamble,
    SendListing {
        listing: Vec<u8>,
        sent: usize,
    },
    SendFile {
        file: File,
        chunk: Box<[u8; CHUNK_SIZE]>,
        len: usize,
        sent: usize,
    },
    ReceiveFile {
        file: File,
    },
    Done,
}

enum PumpOutcome {
    Done,
    Suspended,
    /// Fault on the local file.
    LocalError,
    /// Fault on the data socket.
    RemoteError,
}

pub struct Transfer {
    kind: TransferKind,
    state: TransferState,
}

impl Transfer {
    pub fn new(kind: TransferKind) -> Self {
        Self {
            kind,
            state: TransferState::Start,
        }
    }

    /// Drives the transfer until it suspends or completes. Completion
    /// always leaves the final reply in the session send buffer and the
    /// data channel closed.
    pub fn resume(&mut self, session: &mut Session) -> TransferStep {
        if session.error_flag() {
            self.state = TransferState::Done;
            session.data_channel_mut().close();
            return TransferStep::Completed;
        }

        loop {
            match std::mem::replace(&mut self.state, TransferState::Done) {
                TransferState::Start => {
                    if !self.begin(session) {
                        session.data_channel_mut().close();
                        return TransferStep::Completed;
                    }
                    self.state = TransferState::FlushPreamble;
                }
                TransferState::FlushPreamble => {
                    if !session.flush() {
                        self.state = TransferState::FlushPreamble;
                        return TransferStep::Suspended;
                    }
                    let timeout = session.config().data_timeout();
                    if let Err(e) = session.data_channel_mut().establish(timeout) {
                        debug!("data connection not established: {}", e);
                        session.push_response(b"425 Can't open data connection.\r\n");
                        session.data_channel_mut().close();
                        return TransferStep::Completed;
                    }
                    match self.open_body(session) {
                        Ok(state) => self.state = state,
                        Err(reply) => {
                            session.push_response(reply);
                            session.data_channel_mut().close();
                            return TransferStep::Completed;
                        }
                    }
                }
                TransferState::SendListing { listing, mut sent } => {
                    let outcome = match session.data_channel().socket() {
                        Some(stream) => pump_buffer_to_socket(stream, &listing, &mut sent),
                        None => PumpOutcome::RemoteError,
                    };
                    match outcome {
                        PumpOutcome::Suspended => {
                            self.state = TransferState::SendListing { listing, sent };
                            return TransferStep::Suspended;
                        }
                        PumpOutcome::Done => {
                            session.push_response(b"226 Directory send OK.\r\n")
                        }
                        _ => session
                            .push_response(b"426 Connection error during transfer.\r\n"),
                    }
                    session.data_channel_mut().close();
                    return TransferStep::Completed;
                }
                TransferState::SendFile {
                    mut file,
                    mut chunk,
                    mut len,
                    mut sent,
                } => {
                    let outcome = match session.data_channel().socket() {
                        Some(stream) => {
                            pump_file_to_socket(&mut file, stream, &mut chunk, &mut len, &mut sent)
                        }
                        None => PumpOutcome::RemoteError,
                    };
                    match outcome {
                        PumpOutcome::Suspended => {
                            self.state = TransferState::SendFile {
                                file,
                                chunk,
                                len,
                                sent,
                            };
                            return TransferStep::Suspended;
                        }
                        PumpOutcome::Done => {
                            session.push_response(b"226 Transfer complete.\r\n")
                        }
                        PumpOutcome::LocalError => {
                            session.push_response(b"451 Requested action aborted.\r\n")
                        }
                        PumpOutcome::RemoteError => {
                            session.push_response(b"426 Connection error during transfer.\r\n")
                        }
                    }
                    session.data_channel_mut().close();
                    return TransferStep::Completed;
                }
                TransferState::ReceiveFile { mut file } => {
                    let outcome = match session.data_channel().socket() {
                        Some(stream) => pump_socket_to_file(stream, &mut file),
                        None => PumpOutcome::RemoteError,
                    };
                    match outcome {
                        PumpOutcome::Suspended => {
                            self.state = TransferState::ReceiveFile { file };
                            return TransferStep::Suspended;
                        }
                        PumpOutcome::Done => {
                            session.push_response(b"226 Transfer complete.\r\n")
                        }
                        PumpOutcome::LocalError => {
                            session.push_response(b"552 Storage allocation exceeded.\r\n")
                        }
                        PumpOutcome::RemoteError => {
                            session.push_response(b"426 Connection error during transfer.\r\n")
                        }
                    }
                    session.data_channel_mut().close();
                    return TransferStep::Completed;
                }
                TransferState::Done => return TransferStep::Completed,
            }
        }
    }

    /// Pre-checks and the 150 reply. Returning false means a final reply
    /// was queued instead and the transfer is over.
    fn begin(&self, session: &mut Session) -> bool {
        match &self.kind {
            TransferKind::List => {
                session.push_response(b"150 Opening data connection.\r\n");
                true
            }
            TransferKind::Retrieve(param) => {
                let path = compose_path(session.current_dir(), param);
                match std::fs::metadata(&path) {
                    Ok(meta) if meta.is_file() => {
                        let mut reply = Vec::from(&b"150 Opening data connection for "[..]);
                        reply.extend_from_slice(param);
                        reply.extend_from_slice(b".\r\n");
                        session.push_response(&reply);
                        true
                    }
                    _ => {
                        session.push_response(b"550 File not found.\r\n");
                        false
                    }
                }
            }
            TransferKind::Store(param) => {
                let mut reply = Vec::from(&b"150 Opening data connection for "[..]);
                reply.extend_from_slice(basename(param));
                reply.extend_from_slice(b".\r\n");
                session.push_response(&reply);
                true
            }
        }
    }

    /// Opens the transfer body once the data connection is up.
    fn open_body(&self, session: &mut Session) -> Result<TransferState, &'static [u8]> {
        match &self.kind {
            TransferKind::List => {
                let mut listing = match build_listing(session) {
                    Ok(listing) => listing,
                    Err(e) => {
                        debug!("directory listing failed: {}", e);
                        return Err(b"550 Failed to open directory.\r\n");
                    }
                };
                if session.utf8_mode() {
                    listing =
                        encoding::convert(&listing, &session.config().system_encoding, "UTF-8");
                }
                Ok(TransferState::SendListing { listing, sent: 0 })
            }
            TransferKind::Retrieve(param) => {
                let path = compose_path(session.current_dir(), param);
                match File::open(&path) {
                    Ok(file) => Ok(TransferState::SendFile {
                        file,
                        chunk: Box::new([0u8; CHUNK_SIZE]),
                        len: 0,
                        sent: 0,
                    }),
                    Err(e) => {
                        debug!("failed to open {}: {}", path.display(), e);
                        Err(b"550 Failed to open file.\r\n")
                    }
                }
            }
            TransferKind::Store(param) => {
                let path = compose_path(session.current_dir(), basename(param));
                match OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(0o644)
                    .open(&path)
                {
                    Ok(file) => Ok(TransferState::ReceiveFile { file }),
                    Err(e) => {
                        debug!("failed to create {}: {}", path.display(), e);
                        Err(b"550 Failed to create file.\r\n")
                    }
                }
            }
        }
    }
}

/// The part of the STOR argument after the last `/`.
fn basename(param: &[u8]) -> &[u8] {
    match param.iter().rposition(|&b| b == b'/') {
        Some(i) => &param[i + 1..],
        None => param,
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn pump_buffer_to_socket(
    mut stream: &TcpStream,
    data: &[u8],
    sent: &mut usize,
) -> PumpOutcome {
    while *sent < data.len() {
        match stream.write(&data[*sent..]) {
            Ok(0) => return PumpOutcome::RemoteError,
            Ok(n) => *sent += n,
            Err(ref e) if would_block(e) => return PumpOutcome::Suspended,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("data send failed: {}", e);
                return PumpOutcome::RemoteError;
            }
        }
    }
    PumpOutcome::Done
}

fn pump_file_to_socket(
    file: &mut File,
    mut stream: &TcpStream,
    chunk: &mut [u8; CHUNK_SIZE],
    len: &mut usize,
    sent: &mut usize,
) -> PumpOutcome {
    loop {
        if *sent == *len {
            match file.read(&mut chunk[..]) {
                Ok(0) => return PumpOutcome::Done,
                Ok(n) => {
                    *len = n;
                    *sent = 0;
                }
                Err(e) => {
                    debug!("file read failed: {}", e);
                    return PumpOutcome::LocalError;
                }
            }
        }
        match stream.write(&chunk[*sent..*len]) {
            Ok(0) => return PumpOutcome::RemoteError,
            Ok(n) => *sent += n,
            Err(ref e) if would_block(e) => return PumpOutcome::Suspended,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("data send failed: {}", e);
                return PumpOutcome::RemoteError;
            }
        }
    }
}

fn pump_socket_to_file(mut stream: &TcpStream, file: &mut File) -> PumpOutcome {
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return PumpOutcome::Done,
            Ok(n) => {
                if let Err(e) = file.write_all(&chunk[..n]) {
                    debug!("file write failed: {}", e);
                    return PumpOutcome::LocalError;
                }
            }
            Err(ref e) if would_block(e) => return PumpOutcome::Suspended,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("data receive failed: {}", e);
                return PumpOutcome::RemoteError;
            }
        }
    }
}

fn build_listing(session: &Session) -> io::Result<Vec<u8>> {
    let mut listing = Vec::new();
    for entry in std::fs::read_dir(session.current_dir_path())? {
        let Ok(entry) = entry else { continue };
        // stat failures skip the entry, matching ls-over-changing-dir behavior
        let Ok(meta) = std::fs::metadata(entry.path()) else {
            continue;
        };
        listing.extend_from_slice(&format_entry(entry.file_name().as_bytes(), &meta));
    }
    Ok(listing)
}

/// One UNIX-style listing line:
/// `-rw-r--r-- 1 owner group     1024 Aug 02 14:30 name\r\n`
fn format_entry(name: &[u8], meta: &Metadata) -> Vec<u8> {
    let mode = meta.mode();
    let mut perm = [b'-'; 10];
    if meta.is_dir() {
        perm[0] = b'd';
    }
    let bits: [(u32, u8); 9] = [
        (0o400, b'r'),
        (0o200, b'w'),
        (0o100, b'x'),
        (0o040, b'r'),
        (0o020, b'w'),
        (0o010, b'x'),
        (0o004, b'r'),
        (0o002, b'w'),
        (0o001, b'x'),
    ];
    for (i, (bit, ch)) in bits.iter().enumerate() {
        if mode & bit != 0 {
            perm[i + 1] = *ch;
        }
    }
    let perm: String = perm.iter().map(|&b| b as char).collect();

    let when = Local
        .timestamp_opt(meta.mtime(), 0)
        .single()
        .map(|t| t.format("%b %d %H:%M").to_string())
        .unwrap_or_else(|| String::from("Jan 01 00:00"));

    let mut line = Vec::new();
    line.extend_from_slice(
        format!("{} 1 owner group {:8} {} ", perm, meta.size() as i64, when).as_bytes(),
    );
    line.extend_from_slice(name);
    line.extend_from_slice(b"\r\n");
    line
}
