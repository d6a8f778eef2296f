//! End-to-end tests driving real loopback sessions against a running
//! server. Each test gets its own port and scratch root directory.

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use rill_ftp_server::{Server, ServerConfig};

fn test_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("rill-ftp-it-{}-{}", tag, std::process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    root
}

fn start_server(port: u16, root: &Path, configure: impl FnOnce(&mut ServerConfig)) {
    let mut config = ServerConfig::new(Ipv4Addr::LOCALHOST, root.to_str().unwrap());
    config.port = port;
    configure(&mut config);
    thread::spawn(move || {
        let server = Server::new(config);
        if let Err(e) = server.run() {
            panic!("server failed: {e}");
        }
    });
}

struct Client {
    reader: BufReader<TcpStream>,
}

impl Client {
    /// Connects (retrying while the server thread starts up) and consumes
    /// the welcome banner.
    fn connect(port: u16) -> Self {
        let mut attempts = 50;
        loop {
            match TcpStream::connect((Ipv4Addr::LOCALHOST, port)) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(Duration::from_secs(10)))
                        .unwrap();
                    let mut client = Client {
                        reader: BufReader::new(stream),
                    };
                    assert_eq!(client.reply(), "220 Welcome");
                    return client;
                }
                Err(_) if attempts > 0 => {
                    attempts -= 1;
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => panic!("failed to connect: {e}"),
            }
        }
    }

    fn send(&mut self, command: &str) {
        let stream = self.reader.get_mut();
        stream
            .write_all(format!("{command}\r\n").as_bytes())
            .unwrap();
        stream.flush().unwrap();
    }

    /// Reads one reply line, without the trailing CRLF.
    fn reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end_matches("\r\n").to_string()
    }

    fn cmd(&mut self, command: &str) -> String {
        self.send(command);
        self.reply()
    }

    fn login(&mut self, user: &str, pass: &str) {
        assert_eq!(
            self.cmd(&format!("USER {user}")),
            "331 User name okay, need password."
        );
        assert_eq!(self.cmd(&format!("PASS {pass}")), "230 User logged in.");
    }

    /// Sends PASV and opens the data connection it advertises.
    fn pasv_data_stream(&mut self) -> TcpStream {
        let reply = self.cmd("PASV");
        assert!(
            reply.starts_with("227 Entering Passive Mode ("),
            "unexpected PASV reply: {reply}"
        );
        let open = reply.find('(').unwrap();
        let close = reply.rfind(')').unwrap();
        let fields: Vec<u16> = reply[open + 1..close]
            .split(',')
            .map(|f| f.trim().parse().unwrap())
            .collect();
        assert_eq!(fields.len(), 6, "unexpected PASV reply: {reply}");
        let port = fields[4] * 256 + fields[5];
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }
}

#[test]
fn test_anonymous_listing_over_pasv() {
    let root = test_root("anon-list");
    fs::write(root.join("hello.txt"), b"hello world").unwrap();
    start_server(21701, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21701);
    assert_eq!(
        client.cmd("USER anonymous"),
        "331 User name okay, need password."
    );
    assert_eq!(client.cmd("PASS any"), "230 User logged in.");

    let mut data = client.pasv_data_stream();
    assert_eq!(client.cmd("LIST"), "150 Opening data connection.");

    let mut listing = String::new();
    data.read_to_string(&mut listing).unwrap();
    assert!(listing.contains("hello.txt"), "listing was: {listing}");
    assert!(listing.contains(" 1 owner group "), "listing was: {listing}");

    assert_eq!(client.reply(), "226 Directory send OK.");
    assert_eq!(client.cmd("QUIT"), "221 Goodbye");
}

#[test]
fn test_wrong_password_keeps_session_unauthenticated() {
    let root = test_root("badpass");
    start_server(21702, &root, |c| {
        c.users
            .insert(("alice".to_string(), "good".to_string()));
    });

    let mut client = Client::connect(21702);
    assert_eq!(
        client.cmd("USER alice"),
        "331 User name okay, need password."
    );
    assert_eq!(client.cmd("PASS bad"), "530 Login incorrect.");
    assert_eq!(client.cmd("PWD"), "550 Permission denied.");
}

#[test]
fn test_anonymous_rejected_when_disabled() {
    let root = test_root("no-anon");
    start_server(21703, &root, |_| {});

    let mut client = Client::connect(21703);
    client.cmd("USER anonymous");
    assert_eq!(client.cmd("PASS any"), "530 Anonymous access not allowed.");
    assert_eq!(client.cmd("NOOP"), "550 Permission denied.");
}

#[test]
fn test_upload_then_download_round_trips() {
    let root = test_root("roundtrip");
    start_server(21704, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21704);
    client.login("anonymous", "x");

    let mut data = client.pasv_data_stream();
    assert_eq!(
        client.cmd("STOR hello.txt"),
        "150 Opening data connection for hello.txt."
    );
    data.write_all(b"hi").unwrap();
    drop(data);
    assert_eq!(client.reply(), "226 Transfer complete.");
    assert_eq!(fs::read(root.join("hello.txt")).unwrap(), b"hi");

    let mut data = client.pasv_data_stream();
    assert_eq!(
        client.cmd("RETR hello.txt"),
        "150 Opening data connection for hello.txt."
    );
    let mut contents = Vec::new();
    data.read_to_end(&mut contents).unwrap();
    assert_eq!(contents, b"hi");
    assert_eq!(client.reply(), "226 Transfer complete.");
}

#[test]
fn test_stor_strips_client_directories() {
    let root = test_root("stor-basename");
    start_server(21705, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21705);
    client.login("anonymous", "x");

    let mut data = client.pasv_data_stream();
    assert_eq!(
        client.cmd("STOR ../escape.txt"),
        "150 Opening data connection for escape.txt."
    );
    data.write_all(b"contained").unwrap();
    drop(data);
    assert_eq!(client.reply(), "226 Transfer complete.");

    assert!(root.join("escape.txt").exists());
    assert!(!root.parent().unwrap().join("escape.txt").exists());
}

#[test]
fn test_retr_missing_file() {
    let root = test_root("retr-missing");
    start_server(21706, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21706);
    client.login("anonymous", "x");
    assert_eq!(client.cmd("RETR nope.txt"), "550 File not found.");
    // The session survives a failed transfer.
    assert_eq!(client.cmd("NOOP"), "200 NOOP ok");
}

#[test]
fn test_port_malformed_is_rejected() {
    let root = test_root("bad-port");
    start_server(21707, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21707);
    client.login("anonymous", "x");
    assert_eq!(
        client.cmd("PORT 1,2,3,4,5"),
        "501 Syntax error in parameters or arguments."
    );
    assert_eq!(
        client.cmd("PORT 1,2,3,4,5,999"),
        "501 Syntax error in parameters or arguments."
    );
}

#[test]
fn test_parse_overflow_closes_connection() {
    let root = test_root("overflow");
    start_server(21708, &root, |_| {});

    let mut client = Client::connect(21708);
    let stream = client.reader.get_mut();
    stream.write_all(&[b'A'; 1100]).unwrap();
    stream.flush().unwrap();

    // The server flags the protocol error and tears the connection down.
    let mut buf = [0u8; 256];
    let mut rounds = 0;
    loop {
        match client.reader.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {
                rounds += 1;
                assert!(rounds < 100, "server kept sending instead of closing");
            }
            Err(e) => panic!("server did not close the connection: {e}"),
        }
    }
}

#[test]
fn test_feat_advertises_utf8() {
    let root = test_root("feat");
    start_server(21709, &root, |c| {
        c.anonymous_allowed = true;
        c.utf8_capability = true;
    });

    let mut client = Client::connect(21709);
    client.login("anonymous", "x");
    client.send("FEAT");
    assert_eq!(client.reply(), "211-Features:");
    assert_eq!(client.reply(), " PASV");
    assert_eq!(client.reply(), " SIZE");
    assert_eq!(client.reply(), " UTF8");
    assert_eq!(client.reply(), " OPTS UTF8");
    assert_eq!(client.reply(), " 211 End");
}

#[test]
fn test_opts_toggles_utf8_mode() {
    let root = test_root("opts");
    start_server(21710, &root, |c| {
        c.anonymous_allowed = true;
        c.utf8_capability = true;
    });

    let mut client = Client::connect(21710);
    client.login("anonymous", "x");
    assert_eq!(client.cmd("OPTS utf8 on"), "200 UTF-8 mode enabled.");
    assert_eq!(client.cmd("OPTS utf8 off"), "200 UTF-8 mode disabled.");
    assert_eq!(client.cmd("OPTS utf8 maybe"), "501 Option not supported.");
}

#[test]
fn test_opts_refused_without_capability() {
    let root = test_root("opts-off");
    start_server(21711, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21711);
    client.login("anonymous", "x");
    assert_eq!(client.cmd("OPTS utf8 on"), "501 Option not supported.");
}

#[test]
fn test_pwd_tracks_cwd() {
    let root = test_root("pwd-cwd");
    fs::create_dir(root.join("sub")).unwrap();
    start_server(21712, &root, |c| c.anonymous_allowed = true);
    let root_str = root.to_str().unwrap().to_string();

    let mut client = Client::connect(21712);
    client.login("anonymous", "x");
    assert_eq!(client.cmd("PWD"), format!("257 \"{root_str}\""));
    assert_eq!(
        client.cmd("CWD sub"),
        format!("250 Directory changed to {root_str}/sub.")
    );
    assert_eq!(client.cmd("PWD"), format!("257 \"{root_str}/sub\""));
    assert_eq!(
        client.cmd("CWD missing"),
        "550 Failed to change directory. Directory does not exist or is not accessible."
    );
    // A failed CWD leaves the directory unchanged.
    assert_eq!(client.cmd("PWD"), format!("257 \"{root_str}/sub\""));
}

#[test]
fn test_rename_flow() {
    let root = test_root("rename");
    fs::write(root.join("a.txt"), b"data").unwrap();
    start_server(21713, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21713);
    client.login("anonymous", "x");

    assert_eq!(client.cmd("RNTO b.txt"), "503 RNFR required.");
    assert_eq!(client.cmd("RNFR missing.txt"), "550 File not found.");
    assert_eq!(client.cmd("RNFR a.txt"), "350 Ready for RNTO.");
    assert_eq!(client.cmd("RNTO b.txt"), "250 Rename ok.");
    assert!(root.join("b.txt").exists());
    assert!(!root.join("a.txt").exists());
    // RNTO consumed the pending source.
    assert_eq!(client.cmd("RNTO c.txt"), "503 RNFR required.");
}

#[test]
fn test_directory_and_file_management() {
    let root = test_root("mgmt");
    fs::write(root.join("sized.bin"), vec![0u8; 513]).unwrap();
    start_server(21714, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21714);
    client.login("anonymous", "x");

    assert_eq!(client.cmd("MKD fresh"), "257 \"fresh\" created.");
    assert!(root.join("fresh").is_dir());
    assert_eq!(client.cmd("MKD fresh"), "550 Exists");
    assert_eq!(client.cmd("RMD fresh"), "250 Directory removed.");
    assert_eq!(client.cmd("RMD fresh"), "550 Remove failed.");

    assert_eq!(client.cmd("SIZE sized.bin"), "213 513");
    assert_eq!(client.cmd("SIZE missing.bin"), "550 File not found.");
    assert_eq!(client.cmd("DELE sized.bin"), "250 File deleted.");
    assert_eq!(client.cmd("DELE sized.bin"), "550 Delete failed.");
}

#[test]
fn test_pipelined_commands_keep_order() {
    let root = test_root("pipeline");
    start_server(21715, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21715);
    client.login("anonymous", "x");

    let stream = client.reader.get_mut();
    stream.write_all(b"NOOP\r\nSYST\r\nTYPE A\r\n").unwrap();
    stream.flush().unwrap();

    assert_eq!(client.reply(), "200 NOOP ok");
    assert_eq!(client.reply(), "215 UNIX Type: L8");
    assert_eq!(client.reply(), "200 Type set to A");
}

#[test]
fn test_unknown_commands() {
    let root = test_root("unknown");
    start_server(21716, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21716);
    client.login("anonymous", "x");
    assert_eq!(client.cmd("BOGUS"), "501 Syntax error");
    assert_eq!(client.cmd("BOGUS arg"), "500 Command error.");
}

#[test]
fn test_shutdown_flag_stops_server() {
    let root = test_root("shutdown");
    let mut config = ServerConfig::new(Ipv4Addr::LOCALHOST, root.to_str().unwrap());
    config.port = 21718;
    config.anonymous_allowed = true;

    let server = Server::new(config);
    let flag = server.shutdown_flag();
    let handle = thread::spawn(move || server.run());

    // A live session does not keep the server from stopping.
    let _client = Client::connect(21718);
    flag.store(true, Ordering::SeqCst);
    handle.join().unwrap().expect("server exited with an error");
}

#[test]
fn test_active_mode_retrieval() {
    let root = test_root("active");
    fs::write(root.join("payload.bin"), b"active mode bytes").unwrap();
    start_server(21717, &root, |c| c.anonymous_allowed = true);

    let mut client = Client::connect(21717);
    client.login("anonymous", "x");

    // Listen on an ephemeral port and advertise it with PORT.
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let command = format!("PORT 127,0,0,1,{},{}", port / 256, port % 256);
    assert_eq!(client.cmd(&command), "200 PORT command successful.");

    assert_eq!(
        client.cmd("RETR payload.bin"),
        "150 Opening data connection for payload.bin."
    );
    let (mut data, _) = listener.accept().unwrap();
    let mut contents = Vec::new();
    data.read_to_end(&mut contents).unwrap();
    assert_eq!(contents, b"active mode bytes");
    assert_eq!(client.reply(), "226 Transfer complete.");
}
