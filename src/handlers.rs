//! Command dispatch
//!
//! Scans complete `CMD[ SP ARG]\r\n` lines out of the session parse buffer
//! and runs them against the command table. USER, PASS and OPTS are handled
//! before the authentication gate; every other command answers
//! `550 Permission denied.` until the session is authenticated. Dispatch
//! stops early when a command starts a transfer that suspends, leaving the
//! remaining bytes queued for the next read event.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;

use log::{info, warn};

use crate::data_channel::parse_port_param;
use crate::session::{compose_path, Session};
use crate::transfer::TransferKind;

/// Dispatches every complete line in the parse buffer, stopping early if a
/// transfer suspends.
pub fn parse_and_dispatch(session: &mut Session) {
    loop {
        let Some(pos) = find_crlf(session.parse_buffer()) else {
            break;
        };
        let line: Vec<u8> = session.parse_buffer()[..pos].to_vec();
        session.consume_parsed(pos + 2);

        let (cmd, param) = split_command(&line);
        if !dispatch(session, &cmd, param) {
            break;
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Splits a line at the first space into an uppercased command and the raw
/// parameter bytes.
fn split_command(line: &[u8]) -> (String, &[u8]) {
    match line.iter().position(|&b| b == b' ') {
        Some(i) => (ascii_upper(&line[..i]), &line[i + 1..]),
        None => (ascii_upper(line), &[][..]),
    }
}

fn ascii_upper(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| (b as char).to_ascii_uppercase())
        .collect()
}

/// Runs one command. Returns false when the command started a transfer
/// that suspended; the caller must stop parsing until it completes.
fn dispatch(session: &mut Session, cmd: &str, raw_param: &[u8]) -> bool {
    let param = session.decode_param(raw_param);
    info!(
        "{} Command: [{}] Param: [{}]",
        session.peer(),
        cmd,
        String::from_utf8_lossy(&param)
    );

    match cmd {
        "USER" => {
            session.set_user(String::from_utf8_lossy(&param).into_owned());
            session.push_response(b"331 User name okay, need password.\r\n");
            return true;
        }
        "PASS" => {
            handle_pass(session, &param);
            return true;
        }
        "OPTS" => {
            handle_opts(session, &param);
            return true;
        }
        _ => {}
    }

    if !session.authenticated() {
        session.push_response(b"550 Permission denied.\r\n");
        return true;
    }

    if param.is_empty() {
        match cmd {
            "PWD" | "XPWD" => {
                let mut reply = Vec::from(&b"257 \""[..]);
                reply.extend_from_slice(session.current_dir());
                reply.extend_from_slice(b"\"\r\n");
                let reply = session.encode_reply(reply);
                session.push_response(&reply);
            }
            "SYST" => session.push_response(b"215 UNIX Type: L8\r\n"),
            "FEAT" => {
                session.push_response(b"211-Features:\r\n PASV\r\n SIZE\r\n");
                if session.config().utf8_capability {
                    session.push_response(b" UTF8\r\n OPTS UTF8\r\n");
                }
                session.push_response(b" 211 End\r\n");
            }
            "QUIT" => session.push_response(b"221 Goodbye\r\n"),
            "NOOP" => session.push_response(b"200 NOOP ok\r\n"),
            "TYPE" => session.push_response(b"200 Type set to I\r\n"),
            "PASV" => handle_pasv(session),
            "LIST" | "NLST" => return session.start_transfer(TransferKind::List),
            _ => session.push_response(b"501 Syntax error\r\n"),
        }
    } else {
        match cmd {
            "CWD" | "XCWD" => handle_cwd(session, &param),
            "TYPE" => {
                if param == b"A" || param == b"I" {
                    let mut reply = Vec::from(&b"200 Type set to "[..]);
                    reply.extend_from_slice(&param);
                    reply.extend_from_slice(b"\r\n");
                    session.push_response(&reply);
                } else {
                    session.push_response(b"504 Invalid type.\r\n");
                }
            }
            "PORT" => handle_port(session, &param),
            "SIZE" => {
                let path = compose_path(session.current_dir(), &param);
                match fs::metadata(&path) {
                    Ok(meta) => {
                        session.push_response(format!("213 {}\r\n", meta.len()).as_bytes())
                    }
                    Err(_) => session.push_response(b"550 File not found.\r\n"),
                }
            }
            "RNFR" => {
                let mut source = session.current_dir().to_vec();
                source.push(b'/');
                source.extend_from_slice(&param);
                if fs::metadata(PathBuf::from(OsString::from_vec(source.clone()))).is_ok() {
                    session.set_rename_from(source);
                    session.push_response(b"350 Ready for RNTO.\r\n");
                } else {
                    session.push_response(b"550 File not found.\r\n");
                }
            }
            "RNTO" => match session.take_rename_from() {
                None => session.push_response(b"503 RNFR required.\r\n"),
                Some(source) => {
                    let from = PathBuf::from(OsString::from_vec(source));
                    let to = compose_path(session.current_dir(), &param);
                    if fs::rename(&from, &to).is_ok() {
                        session.push_response(b"250 Rename ok.\r\n");
                    } else {
                        session.push_response(b"550 Rename failed.\r\n");
                    }
                }
            },
            "DELE" => {
                let path = compose_path(session.current_dir(), &param);
                if fs::remove_file(&path).is_ok() {
                    session.push_response(b"250 File deleted.\r\n");
                } else {
                    session.push_response(b"550 Delete failed.\r\n");
                }
            }
            "RMD" => {
                let path = compose_path(session.current_dir(), &param);
                if fs::remove_dir(&path).is_ok() {
                    session.push_response(b"250 Directory removed.\r\n");
                } else {
                    session.push_response(b"550 Remove failed.\r\n");
                }
            }
            "MKD" | "XMKD" => handle_mkd(session, &param),
            "RETR" => return session.start_transfer(TransferKind::Retrieve(param)),
            "STOR" => return session.start_transfer(TransferKind::Store(param)),
            _ => session.push_response(b"500 Command error.\r\n"),
        }
    }
    true
}

fn handle_pass(session: &mut Session, param: &[u8]) {
    if session.user() == "anonymous" {
        if session.config().anonymous_allowed {
            session.set_authenticated(true);
            session.push_response(b"230 User logged in.\r\n");
        } else {
            session.push_response(b"530 Anonymous access not allowed.\r\n");
        }
        return;
    }

    let password = String::from_utf8_lossy(param).into_owned();
    let credentials = (session.user().to_string(), password);
    if session.config().users.contains(&credentials) {
        session.set_authenticated(true);
        session.push_response(b"230 User logged in.\r\n");
    } else {
        session.push_response(b"530 Login incorrect.\r\n");
    }
}

fn handle_opts(session: &mut Session, param: &[u8]) {
    if !session.config().utf8_capability {
        session.push_response(b"501 Option not supported.\r\n");
        return;
    }
    match param {
        b"utf8 on" | b"UTF8 ON" => {
            session.set_utf8_mode(true);
            session.push_response(b"200 UTF-8 mode enabled.\r\n");
        }
        b"utf8 off" | b"UTF8 OFF" => {
            session.set_utf8_mode(false);
            session.push_response(b"200 UTF-8 mode disabled.\r\n");
        }
        _ => session.push_response(b"501 Option not supported.\r\n"),
    }
}

fn handle_cwd(session: &mut Session, param: &[u8]) {
    let target: Vec<u8> = if param.first() == Some(&b'/') {
        param.to_vec()
    } else {
        let mut composed = session.current_dir().to_vec();
        composed.push(b'/');
        composed.extend_from_slice(param);
        composed
    };

    let path = PathBuf::from(OsString::from_vec(target.clone()));
    if fs::read_dir(&path).is_ok() {
        let mut reply = Vec::from(&b"250 Directory changed to "[..]);
        reply.extend_from_slice(&target);
        reply.extend_from_slice(b".\r\n");
        session.set_current_dir(target);
        session.push_response(&reply);
    } else {
        session.push_response(
            b"550 Failed to change directory. Directory does not exist or is not accessible.\r\n",
        );
    }
}

fn handle_port(session: &mut Session, param: &[u8]) {
    match parse_port_param(&String::from_utf8_lossy(param)) {
        Some(target) => {
            session.data_channel_mut().set_active(target);
            session.push_response(b"200 PORT command successful.\r\n");
        }
        None => session.push_response(b"501 Syntax error in parameters or arguments.\r\n"),
    }
}

fn handle_pasv(session: &mut Session) {
    match session.data_channel_mut().set_passive() {
        Ok(port) => {
            let octets = session.config().bind_ip.octets();
            let reply = format!(
                "227 Entering Passive Mode ({},{},{},{},{},{})\r\n",
                octets[0],
                octets[1],
                octets[2],
                octets[3],
                port / 256,
                port % 256
            );
            session.push_response(reply.as_bytes());
        }
        Err(e) => {
            warn!("failed to open passive listener: {}", e);
            session.push_response(b"425 Can't open passive socket.\r\n");
        }
    }
}

fn handle_mkd(session: &mut Session, param: &[u8]) {
    let path = compose_path(session.current_dir(), param);
    match fs::DirBuilder::new().mode(0o755).create(&path) {
        Ok(()) => {
            let mut reply = Vec::from(&b"257 \""[..]);
            reply.extend_from_slice(param);
            reply.extend_from_slice(b"\" created.\r\n");
            let reply = session.encode_reply(reply);
            session.push_response(&reply);
        }
        Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => {
            session.push_response(b"550 Exists\r\n");
        }
        Err(_) => session.push_response(b"550 Create failed\r\n"),
    }
}
