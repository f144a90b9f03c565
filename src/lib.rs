//! An encrypted SOCKS5 tunnel: a local proxy that accepts plain SOCKS5
//! connections and relays them, AES-128-CTR encrypted, to a remote proxy
//! which decrypts and forwards to the real destination.
//!
//! The two binaries (`fakio-local`, `fakio-server`) share everything
//! below the CLI boundary: the buffer/crypto/context primitives, the
//! `mio`-based reactor, the SOCKS5 and handshake wire code, and the
//! relay state machine. See `DESIGN.md` for how each module maps back to
//! its source material.

#![warn(rust_2018_idioms)]

pub mod buffer;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod local;
pub mod reactor;
pub mod relay;
pub mod remote;
pub mod socks5;
pub mod timer;
pub mod user;
pub mod wire;

pub use context::{Context, ContextKey, ContextPool, Role};
pub use error::{Error, Result};
pub use reactor::Reactor;
