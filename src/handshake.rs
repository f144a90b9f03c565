//! Wire framing for the tunnel handshake (`spec.md` §4.g): the fixed
//! 1024-byte local->remote frame and the fixed 64-byte remote->local
//! reply. Pure encode/decode functions — no I/O, no socket state.

use rand::RngCore;

use crate::buffer::{HANDSHAKE_REPLY_SIZE, HANDSHAKE_SIZE};
use crate::config::MAX_USERNAME_LEN;
use crate::crypto::{CryptoState, SESSION_KEY_MATERIAL_LEN};
use crate::error::{Error, Result};
use crate::socks5::{self, Address};

const IV_LEN: usize = 16;
const NAME_LEN_OFFSET: usize = IV_LEN;
const NAME_OFFSET: usize = NAME_LEN_OFFSET + 1;

/// Build the local proxy's handshake frame: `iv ∥ name_len ∥ username ∥
/// encrypt_all(iv, "\x05 CMD RSV ATYP addr port")`, zero-padded to
/// [`HANDSHAKE_SIZE`] bytes.
pub fn build_client_frame(
    handshake_key: [u8; 32],
    username: &str,
    address: &Address,
) -> Result<[u8; HANDSHAKE_SIZE]> {
    if username.len() > MAX_USERNAME_LEN {
        return Err(Error::protocol("username too long for handshake frame"));
    }

    let inner = socks5::encode_request(socks5::SOCKS_VERSION, address);
    let name_offset = NAME_OFFSET;
    let cipher_offset = name_offset + username.len();
    if cipher_offset + inner.len() > HANDSHAKE_SIZE {
        return Err(Error::protocol("handshake payload too large for frame"));
    }

    let mut frame = [0u8; HANDSHAKE_SIZE];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    frame[..IV_LEN].copy_from_slice(&iv);
    frame[NAME_LEN_OFFSET] = username.len() as u8;
    frame[name_offset..cipher_offset].copy_from_slice(username.as_bytes());

    let crypto = CryptoState::new(handshake_key);
    crypto.encrypt_all(&iv, &inner, &mut frame[cipher_offset..cipher_offset + inner.len()]);

    Ok(frame)
}

/// Read just the plaintext username out of a received handshake frame,
/// without decrypting the inner payload. The remote proxy needs this
/// first, to look up which user's key actually decrypts the rest.
pub fn peek_username(frame: &[u8]) -> Result<String> {
    if frame.len() != HANDSHAKE_SIZE {
        return Err(Error::protocol("handshake frame has the wrong size"));
    }
    let name_len = frame[NAME_LEN_OFFSET] as usize;
    if name_len > MAX_USERNAME_LEN {
        return Err(Error::protocol("handshake frame claims an oversized username"));
    }
    let name_offset = NAME_OFFSET;
    let cipher_offset = name_offset + name_len;
    if cipher_offset > HANDSHAKE_SIZE {
        return Err(Error::protocol("handshake frame username overruns the frame"));
    }
    std::str::from_utf8(&frame[name_offset..cipher_offset])
        .map(str::to_string)
        .map_err(|_| Error::protocol("handshake username is not valid UTF-8"))
}

/// Parse a received handshake frame back into the username and the
/// requested CONNECT address. Decrypts the full remaining tail of the
/// frame (zero-padding included) since the inner payload's true length
/// is unknown until `socks5::parse_request` runs.
pub fn parse_client_frame(handshake_key: [u8; 32], frame: &[u8]) -> Result<(String, Address)> {
    if frame.len() != HANDSHAKE_SIZE {
        return Err(Error::protocol("handshake frame has the wrong size"));
    }

    let iv: [u8; IV_LEN] = frame[..IV_LEN].try_into().unwrap();
    let name_len = frame[NAME_LEN_OFFSET] as usize;
    if name_len > MAX_USERNAME_LEN {
        return Err(Error::protocol("handshake frame claims an oversized username"));
    }
    let name_offset = NAME_OFFSET;
    let cipher_offset = name_offset + name_len;
    if cipher_offset > HANDSHAKE_SIZE {
        return Err(Error::protocol("handshake frame username overruns the frame"));
    }

    let username = std::str::from_utf8(&frame[name_offset..cipher_offset])
        .map_err(|_| Error::protocol("handshake username is not valid UTF-8"))?
        .to_string();

    let crypto = CryptoState::new(handshake_key);
    let mut inner = vec![0u8; HANDSHAKE_SIZE - cipher_offset];
    crypto.decrypt_all(&iv, &frame[cipher_offset..], &mut inner);

    let (request, _consumed) = socks5::parse_request(&inner)?;
    Ok((username, request.address))
}

/// Build the remote proxy's reply frame: `iv ∥ encrypt_all(iv,
/// e_iv ∥ d_iv ∥ key)`, exactly [`HANDSHAKE_REPLY_SIZE`] bytes.
pub fn build_server_reply(
    handshake_key: [u8; 32],
    material: &[u8; SESSION_KEY_MATERIAL_LEN],
) -> [u8; HANDSHAKE_REPLY_SIZE] {
    let mut frame = [0u8; HANDSHAKE_REPLY_SIZE];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    frame[..IV_LEN].copy_from_slice(&iv);

    let crypto = CryptoState::new(handshake_key);
    crypto.encrypt_all(&iv, material, &mut frame[IV_LEN..]);
    frame
}

/// Recover `e_iv ∥ d_iv ∥ key` from a received reply frame.
pub fn parse_server_reply(
    handshake_key: [u8; 32],
    frame: &[u8; HANDSHAKE_REPLY_SIZE],
) -> [u8; SESSION_KEY_MATERIAL_LEN] {
    let iv: [u8; IV_LEN] = frame[..IV_LEN].try_into().unwrap();
    let crypto = CryptoState::new(handshake_key);
    let mut material = [0u8; SESSION_KEY_MATERIAL_LEN];
    crypto.decrypt_all(&iv, &frame[IV_LEN..], &mut material);
    material
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    #[test]
    fn client_frame_roundtrips() {
        let key = [9u8; 32];
        let address = Address::Ip(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(198, 51, 100, 7),
            443,
        )));
        let frame = build_client_frame(key, "alice", &address).unwrap();
        assert_eq!(frame.len(), HANDSHAKE_SIZE);

        let (username, parsed_address) = parse_client_frame(key, &frame).unwrap();
        assert_eq!(username, "alice");
        assert_eq!(parsed_address, address);
    }

    #[test]
    fn client_frame_roundtrips_with_domain_address() {
        let key = [2u8; 32];
        let address = Address::Domain("example.com".to_string(), 8443);
        let frame = build_client_frame(key, "bob", &address).unwrap();
        let (username, parsed_address) = parse_client_frame(key, &frame).unwrap();
        assert_eq!(username, "bob");
        assert_eq!(parsed_address, address);
    }

    #[test]
    fn peek_username_reads_without_the_key() {
        let address = Address::Domain("example.com".to_string(), 8443);
        let frame = build_client_frame([1u8; 32], "carol", &address).unwrap();
        assert_eq!(peek_username(&frame).unwrap(), "carol");
    }

    #[test]
    fn oversized_username_is_rejected() {
        let key = [0u8; 32];
        let address = Address::Domain("x".into(), 1);
        let long_name = "a".repeat(MAX_USERNAME_LEN + 1);
        assert!(build_client_frame(key, &long_name, &address).is_err());
    }

    #[test]
    fn server_reply_roundtrips() {
        let key = [5u8; 32];
        let mut material = [0u8; SESSION_KEY_MATERIAL_LEN];
        for (i, b) in material.iter_mut().enumerate() {
            *b = i as u8;
        }
        let frame = build_server_reply(key, &material);
        assert_eq!(frame.len(), HANDSHAKE_REPLY_SIZE);
        let recovered = parse_server_reply(key, &frame);
        assert_eq!(recovered, material);
    }
}
