//! Configuration structs and loaders for both binaries (`spec.md` §6).
//!
//! Two distinct strongly-typed configs, one per binary, each with its own
//! section/key whitelist — unknown sections or keys fail the load.

pub mod ini;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Maximum username length accepted in `[user] name` / handshake frames.
pub const MAX_USERNAME_LEN: usize = 32;

/// `fakio-local`'s configuration: where the remote proxy lives, where to
/// listen locally, and the one user identity this client authenticates
/// as.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub client_host: String,
    pub client_port: u16,
    pub username: String,
    /// `SHA-256(password)`, precomputed at load time (`spec.md` §6).
    pub key: [u8; 32],
}

/// `fakio-server`'s configuration: its listen endpoint and the directory
/// of users it accepts.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// name -> raw 32-byte key, parsed from a 64-character hex string.
    pub users: HashMap<String, [u8; 32]>,
}

pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    let source = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("can't load config file {}: {e}", path.display())))?;
    let entries = ini::parse(&source)?;

    let mut server_host = None;
    let mut server_port = None;
    let mut client_host = None;
    let mut client_port = None;
    let mut username = None;
    let mut key = None;

    for entry in &entries {
        match (entry.section.as_str(), entry.key.as_str()) {
            ("server", "host") => server_host = Some(entry.value.clone()),
            ("server", "port") => server_port = Some(parse_port(&entry.value)?),
            ("client", "host") => client_host = Some(entry.value.clone()),
            ("client", "port") => client_port = Some(parse_port(&entry.value)?),
            ("user", "name") => {
                if entry.value.len() > MAX_USERNAME_LEN {
                    return Err(Error::config(format!(
                        "user name too long, must be <= {MAX_USERNAME_LEN} bytes"
                    )));
                }
                username = Some(entry.value.clone());
            }
            ("user", "password") => {
                let mut hasher = Sha256::new();
                hasher.update(entry.value.as_bytes());
                let digest: [u8; 32] = hasher.finalize().into();
                key = Some(digest);
            }
            (section, key) => {
                return Err(Error::config(format!(
                    "unrecognized config entry [{section}] {key}"
                )))
            }
        }
    }

    Ok(ClientConfig {
        server_host: server_host.ok_or_else(|| Error::config("missing [server] host"))?,
        server_port: server_port.ok_or_else(|| Error::config("missing [server] port"))?,
        client_host: client_host.ok_or_else(|| Error::config("missing [client] host"))?,
        client_port: client_port.ok_or_else(|| Error::config("missing [client] port"))?,
        username: username.ok_or_else(|| Error::config("missing [user] name"))?,
        key: key.ok_or_else(|| Error::config("missing [user] password"))?,
    })
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let source = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("can't load config file {}: {e}", path.display())))?;
    let entries = ini::parse(&source)?;

    let mut host = None;
    let mut port = None;
    let mut users = HashMap::new();

    for entry in &entries {
        match entry.section.as_str() {
            "server" => match entry.key.as_str() {
                "host" => host = Some(entry.value.clone()),
                "port" => port = Some(parse_port(&entry.value)?),
                key => return Err(Error::config(format!("unrecognized [server] key {key}"))),
            },
            "users" => {
                let raw = hex::decode(&entry.value).map_err(|e| {
                    Error::config(format!("user '{}': invalid hex key: {e}", entry.key))
                })?;
                let key: [u8; 32] = raw.try_into().map_err(|raw: Vec<u8>| {
                    Error::config(format!(
                        "user '{}': key must be 32 bytes, got {}",
                        entry.key,
                        raw.len()
                    ))
                })?;
                users.insert(entry.key.clone(), key);
            }
            section => return Err(Error::config(format!("unrecognized section [{section}]"))),
        }
    }

    Ok(ServerConfig {
        host: host.ok_or_else(|| Error::config("missing [server] host"))?,
        port: port.ok_or_else(|| Error::config("missing [server] port"))?,
        users,
    })
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::config(format!("invalid port: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> tempfile_path::TempFile {
        tempfile_path::TempFile::new(contents)
    }

    // A tiny inline temp-file helper so the test doesn't need a
    // `tempfile` dev-dependency for two config tests.
    mod tempfile_path {
        use std::fs;
        use std::path::PathBuf;

        pub struct TempFile {
            pub path: PathBuf,
        }

        impl TempFile {
            pub fn new(contents: &str) -> Self {
                let mut path = std::env::temp_dir();
                path.push(format!("fakio-test-{}.ini", std::process::id()));
                fs::write(&path, contents).unwrap();
                Self { path }
            }
        }

        impl Drop for TempFile {
            fn drop(&mut self) {
                let _ = fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn loads_a_valid_client_config() {
        let tmp = write_temp(
            "[server]\nhost = 203.0.113.9\nport = 8388\n\n\
             [client]\nhost = 127.0.0.1\nport = 1080\n\n\
             [user]\nname = alice\npassword = hunter2\n",
        );
        let cfg = load_client_config(&tmp.path).unwrap();
        assert_eq!(cfg.server_host, "203.0.113.9");
        assert_eq!(cfg.server_port, 8388);
        assert_eq!(cfg.username, "alice");
    }

    #[test]
    fn unknown_key_fails_the_load() {
        let tmp = write_temp("[server]\nhost = x\nport = 1\nbogus = 1\n");
        assert!(load_server_config(&tmp.path).is_err());
    }

    #[test]
    fn server_config_parses_hex_user_keys() {
        let hex_key = "ab".repeat(32);
        let contents = format!("[server]\nhost = 0.0.0.0\nport = 8388\n\n[users]\nalice = {hex_key}\n");
        let tmp = write_temp(&contents);
        let cfg = load_server_config(&tmp.path).unwrap();
        assert_eq!(cfg.users["alice"], [0xab; 32]);
    }
}
