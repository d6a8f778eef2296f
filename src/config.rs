//! Server configuration
//!
//! Loads the line-oriented configuration file. Each setting is a `<key>:`
//! line followed by a single `$<value>` line; the `users` key is followed by
//! any number of `$<username> <password>` lines. `#` starts a comment and
//! surrounding whitespace is ignored. `ip` and `dir` are required, all other
//! keys have defaults.
//!
//! ```text
//! ip:
//! $127.0.0.1
//! dir:
//! $/srv/ftp
//! users:
//! $alice secret
//! ```

use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 4567;
pub const DEFAULT_RW_TIMEOUT: u32 = 5;

/// Longest root directory path accepted from the configuration file.
const MAX_ROOT_LEN: usize = 1023;

/// Process-wide server settings, immutable once loaded.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Base directory new sessions start in.
    pub root_dir: String,
    /// Address advertised in PASV responses.
    pub bind_ip: Ipv4Addr,
    /// Control-channel listen port.
    pub port: u16,
    /// Timeout in seconds for data-socket reads, writes, accepts and
    /// connects. Zero disables the timeout.
    pub rw_timeout: u32,
    pub anonymous_allowed: bool,
    /// Whether UTF-8 is advertised in FEAT and honored by OPTS.
    pub utf8_capability: bool,
    /// The host's native character encoding, derived from the locale.
    pub system_encoding: String,
    /// Valid `(username, password)` pairs.
    pub users: HashSet<(String, String)>,
}

impl ServerConfig {
    /// Creates a configuration with defaults for everything but the
    /// advertised address and root directory.
    pub fn new(bind_ip: Ipv4Addr, root_dir: impl Into<String>) -> Self {
        Self {
            root_dir: root_dir.into(),
            bind_ip,
            port: DEFAULT_PORT,
            rw_timeout: DEFAULT_RW_TIMEOUT,
            anonymous_allowed: false,
            utf8_capability: false,
            system_encoding: locale_encoding(),
            users: HashSet::new(),
        }
    }

    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, ConfigError> {
        let lines: Vec<&str> = text.lines().collect();

        let mut bind_ip: Option<Ipv4Addr> = None;
        let mut root_dir: Option<String> = None;
        let mut port = DEFAULT_PORT;
        let mut rw_timeout = DEFAULT_RW_TIMEOUT;
        let mut anonymous_allowed = false;
        let mut utf8_capability = false;
        let mut users = HashSet::new();

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i].trim();
            if line.is_empty() || line.starts_with('#') {
                i += 1;
                continue;
            }

            let key = line
                .strip_suffix(':')
                .ok_or(ConfigError::MissingColon { line: i + 1 })?;
            let key_line = i + 1;
            i += 1;

            if key == "users" {
                while i < lines.len() {
                    let user_line = lines[i].trim();
                    let Some(entry) = user_line.strip_prefix('$') else {
                        break;
                    };
                    let entry = entry.trim();
                    let (username, password) =
                        entry
                            .split_once(' ')
                            .ok_or_else(|| ConfigError::InvalidValue {
                                line: i + 1,
                                key: key.to_string(),
                            })?;
                    if username.is_empty() || password.is_empty() {
                        return Err(ConfigError::InvalidValue {
                            line: i + 1,
                            key: key.to_string(),
                        });
                    }
                    users.insert((username.to_string(), password.to_string()));
                    i += 1;
                }
                continue;
            }

            let value_line_no = i + 1;
            let value_line = lines
                .get(i)
                .map(|l| l.trim())
                .ok_or(ConfigError::MissingValue { line: value_line_no })?;
            let value = value_line
                .strip_prefix('$')
                .ok_or(ConfigError::MissingValue { line: value_line_no })?
                .trim();
            let invalid = move || ConfigError::InvalidValue {
                line: value_line_no,
                key: key.to_string(),
            };
            i += 1;

            match key {
                "ip" => bind_ip = Some(value.parse().map_err(|_| invalid())?),
                "dir" => {
                    if value.len() > MAX_ROOT_LEN {
                        return Err(invalid());
                    }
                    root_dir = Some(value.to_string());
                }
                "rwtimeout" => rw_timeout = value.parse().map_err(|_| invalid())?,
                "anonymous" => anonymous_allowed = parse_bool(value).ok_or_else(invalid)?,
                "utf-8" => utf8_capability = parse_bool(value).ok_or_else(invalid)?,
                "port" => port = value.parse().map_err(|_| invalid())?,
                _ => {
                    return Err(ConfigError::UnknownKey {
                        line: key_line,
                        key: key.to_string(),
                    })
                }
            }
        }

        Ok(Self {
            root_dir: root_dir.ok_or(ConfigError::MissingKey("dir"))?,
            bind_ip: bind_ip.ok_or(ConfigError::MissingKey("ip"))?,
            port,
            rw_timeout,
            anonymous_allowed,
            utf8_capability,
            system_encoding: locale_encoding(),
            users,
        })
    }

    /// Timeout applied to data-socket operations; `None` when disabled.
    pub fn data_timeout(&self) -> Option<Duration> {
        if self.rw_timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.rw_timeout)))
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Derives the host character encoding from the locale environment, the way
/// `nl_langinfo(CODESET)` reads it: the codeset suffix of
/// `LC_ALL`/`LC_CTYPE`/`LANG` (e.g. `en_US.UTF-8` -> `UTF-8`).
fn locale_encoding() -> String {
    for var in ["LC_ALL", "LC_CTYPE", "LANG"] {
        let Ok(value) = env::var(var) else { continue };
        if value.is_empty() {
            continue;
        }
        if let Some(codeset) = value.split('.').nth(1) {
            let codeset = codeset.split('@').next().unwrap_or(codeset);
            if !codeset.is_empty() {
                return codeset.to_string();
            }
        }
    }
    String::from("UTF-8")
}
