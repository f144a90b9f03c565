//! AES crypto engine (`spec.md` §4.b, resolved against the original C's
//! asymmetric key sizing).
//!
//! Two shapes of call:
//!
//! - "all-at-once" (`encrypt_all`/`decrypt_all`): a throwaway counter
//!   keyed by a caller-supplied IV, used only during the handshake. The
//!   original C keys this stage with the *full* 256-bit user key
//!   (`fhandler.c:100`: `fcrypt_set_key(c->crypto, c->user->key, 256)`;
//!   `fclient.c:175`: `fcrypt_set_key(c->crypto, client.key, 256)`), so
//!   this uses AES-256 rather than truncating to 128 bits — see the
//!   Open Question resolution in `SPEC_FULL.md` §4.b.
//! - "streaming" (`encrypt`/`decrypt`): consumes a [`Buffer`]'s unread
//!   range in place using the session's persistent counter state, one
//!   counter per direction, keyed by the 128-bit key carried inside the
//!   48-byte handshake reply payload (`fclient.c:38-46`:
//!   `fcrypt_set_key(ctx, ctx->key, 128)`).
//!
//! There is deliberately no authentication tag or MAC here — `spec.md`
//! §9 records this as a known, accepted weakness of the wire format, not
//! something this crate silently "fixes".

use aes::{Aes128, Aes256};
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

use crate::buffer::Buffer;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// The two directional IVs and the key derived during the handshake
/// (`spec.md` §4.b: `e_iv ∥ d_iv ∥ key`, 48 bytes total).
pub const SESSION_KEY_MATERIAL_LEN: usize = 48;

/// A session's crypto state: the full 256-bit handshake key (used only
/// for `encrypt_all`/`decrypt_all` before streaming keys are installed)
/// plus, once installed, independent 128-bit keystream cursors for each
/// direction.
pub struct CryptoState {
    handshake_key: [u8; 32],
    encrypt_stream: Option<Aes128Ctr>,
    decrypt_stream: Option<Aes128Ctr>,
}

impl CryptoState {
    /// Create crypto state keyed with a user's full 32-byte key, before
    /// any streaming direction has been installed.
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            handshake_key: key,
            encrypt_stream: None,
            decrypt_stream: None,
        }
    }

    /// Encrypt `n` bytes of `input` into `output` using a throwaway
    /// AES-256 counter seeded from `iv` and the handshake key. Does not
    /// touch the session's streaming state.
    pub fn encrypt_all(&self, iv: &[u8; 16], input: &[u8], output: &mut [u8]) {
        let mut cipher = Aes256Ctr::new((&self.handshake_key).into(), iv.into());
        output[..input.len()].copy_from_slice(input);
        cipher.apply_keystream(&mut output[..input.len()]);
    }

    /// Decrypt is the same XOR operation as encrypt under CTR mode.
    pub fn decrypt_all(&self, iv: &[u8; 16], input: &[u8], output: &mut [u8]) {
        self.encrypt_all(iv, input, output)
    }

    /// Install the post-handshake streaming keys. `bytes` is
    /// `e_iv ∥ d_iv ∥ key` from this side's point of view — callers on
    /// the local proxy and remote proxy mirror `e_iv`/`d_iv` per
    /// `spec.md` §4.b before calling this.
    pub fn init_session_keys(&mut self, bytes: &[u8; SESSION_KEY_MATERIAL_LEN]) {
        let e_iv: [u8; 16] = bytes[0..16].try_into().unwrap();
        let d_iv: [u8; 16] = bytes[16..32].try_into().unwrap();
        let key: [u8; 16] = bytes[32..48].try_into().unwrap();

        self.encrypt_stream = Some(Aes128Ctr::new((&key).into(), (&e_iv).into()));
        self.decrypt_stream = Some(Aes128Ctr::new((&key).into(), (&d_iv).into()));
    }

    /// Encrypt a buffer's unread range in place using the persistent
    /// encrypt-direction cursor. Panics if streaming keys haven't been
    /// installed yet — a programming error, since the relay phase only
    /// starts after `init_session_keys`.
    pub fn encrypt(&mut self, buf: &mut Buffer) {
        let cipher = self
            .encrypt_stream
            .as_mut()
            .expect("encrypt() called before streaming keys were installed");
        Self::apply_in_place(cipher, buf);
    }

    /// Decrypt a buffer's unread range in place using the persistent
    /// decrypt-direction cursor.
    pub fn decrypt(&mut self, buf: &mut Buffer) {
        let cipher = self
            .decrypt_stream
            .as_mut()
            .expect("decrypt() called before streaming keys were installed");
        Self::apply_in_place(cipher, buf);
    }

    fn apply_in_place(cipher: &mut Aes128Ctr, buf: &mut Buffer) {
        if buf.data_len() == 0 {
            return;
        }
        cipher.apply_keystream(buf.readable_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_all_then_decrypt_all_roundtrips() {
        let state = CryptoState::new([7u8; 32]);
        let iv = [3u8; 16];
        let plaintext = b"the quick brown fox jumps";
        let mut ciphertext = vec![0u8; plaintext.len()];
        state.encrypt_all(&iv, plaintext, &mut ciphertext);
        assert_ne!(ciphertext, plaintext);

        let mut decrypted = vec![0u8; plaintext.len()];
        state.decrypt_all(&iv, &ciphertext, &mut decrypted);
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn streaming_encrypt_decrypt_roundtrip_across_chunks() {
        let material = {
            let mut m = [0u8; SESSION_KEY_MATERIAL_LEN];
            for (i, b) in m.iter_mut().enumerate() {
                *b = i as u8;
            }
            m
        };

        let mut sender = CryptoState::new([0u8; 32]);
        sender.init_session_keys(&material);
        let mut receiver = CryptoState::new([0u8; 32]);
        receiver.init_session_keys(&material);

        // Mirror roles: sender's e_iv must equal receiver's d_iv and vice
        // versa for this roundtrip test, so swap the two halves for the
        // receiver exactly as spec.md's L/R mirror mapping describes.
        let mut mirrored = material;
        mirrored[0..16].copy_from_slice(&material[16..32]);
        mirrored[16..32].copy_from_slice(&material[0..16]);
        receiver.init_session_keys(&mirrored);

        for chunk in [b"first chunk".as_slice(), b"second, longer chunk here"] {
            let mut buf = Buffer::with_capacity(64);
            buf.writable_mut()[..chunk.len()].copy_from_slice(chunk);
            buf.advance_write(chunk.len());

            sender.encrypt(&mut buf);
            assert_ne!(buf.readable(), chunk);

            receiver.decrypt(&mut buf);
            assert_eq!(buf.readable(), chunk);
        }
    }
}
