//! Server-side user directory (`spec.md` §4.e): a read-only, hash-keyed
//! set of `{name -> key}` entries loaded from the server config file.

use std::collections::HashMap;

/// One authenticated principal's record.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub name: String,
    /// 32-byte key as stored in the config (`spec.md` §3). Used whole as
    /// the AES-256 handshake key (`fhandler.c:100`); the 128-bit
    /// streaming key is a different value carried inside the handshake
    /// reply payload, not derived from this field (`spec.md` §4.g).
    pub key: [u8; 32],
}

impl UserRecord {
    /// The key used to decrypt an inbound handshake frame — the full
    /// 32-byte record, matching the original C's
    /// `fcrypt_set_key(c->crypto, c->user->key, 256)`.
    pub fn handshake_key(&self) -> [u8; 32] {
        self.key
    }
}

/// Read-only after construction: built once at startup from
/// [`crate::config::ServerConfig`], then shared (via `Rc`) across every
/// accepted connection's handshake lookup.
#[derive(Debug, Clone)]
pub struct UserDirectory {
    users: HashMap<String, UserRecord>,
}

impl UserDirectory {
    pub fn from_config(users: HashMap<String, [u8; 32]>) -> Self {
        let users = users
            .into_iter()
            .map(|(name, key)| {
                (
                    name.clone(),
                    UserRecord {
                        name,
                        key,
                    },
                )
            })
            .collect();
        Self { users }
    }

    pub fn find(&self, name: &str) -> Option<&UserRecord> {
        self.users.get(name)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_known_user_and_rejects_unknown() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), [1u8; 32]);
        let dir = UserDirectory::from_config(users);

        assert!(dir.find("alice").is_some());
        assert!(dir.find("ghost").is_none());
        assert_eq!(dir.find("alice").unwrap().handshake_key(), [1u8; 32]);
    }
}
