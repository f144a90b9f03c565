//! Property-based tests for the crypto engine and handshake framing
//! (`spec.md` §8: "encryption on the wire" and "handshake idempotence
//! under replay").

use fakio::crypto::{CryptoState, SESSION_KEY_MATERIAL_LEN};
use fakio::handshake;
use fakio::socks5::Address;
use proptest::prelude::*;

proptest! {
    /// No prefix of length >= 16 of the plaintext should survive
    /// unchanged in the ciphertext, for any key/IV/plaintext combination.
    #[test]
    fn streaming_ciphertext_never_contains_a_plaintext_prefix(
        key in any::<[u8; 16]>(),
        iv in any::<[u8; 16]>(),
        plaintext in prop::collection::vec(any::<u8>(), 16..256),
    ) {
        let mut material = [0u8; SESSION_KEY_MATERIAL_LEN];
        material[0..16].copy_from_slice(&iv);
        material[16..32].copy_from_slice(&iv);
        material[32..48].copy_from_slice(&key);

        // The handshake key is irrelevant here: only the streaming
        // cursors installed by `init_session_keys` below are exercised.
        let mut crypto = CryptoState::new([0u8; 32]);
        crypto.init_session_keys(&material);

        let mut buf = fakio::buffer::Buffer::with_capacity(plaintext.len());
        buf.writable_mut()[..plaintext.len()].copy_from_slice(&plaintext);
        buf.advance_write(plaintext.len());
        crypto.encrypt(&mut buf);
        let ciphertext = buf.readable().to_vec();

        prop_assert_ne!(&ciphertext[..16], &plaintext[..16]);
    }

    /// Streaming encrypt followed by streaming decrypt with mirrored IVs
    /// recovers the original plaintext, regardless of chunk boundaries.
    #[test]
    fn streaming_roundtrips_for_any_key_and_chunking(
        key in any::<[u8; 16]>(),
        e_iv in any::<[u8; 16]>(),
        d_iv in any::<[u8; 16]>(),
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8),
    ) {
        let mut sender_material = [0u8; SESSION_KEY_MATERIAL_LEN];
        sender_material[0..16].copy_from_slice(&e_iv);
        sender_material[16..32].copy_from_slice(&d_iv);
        sender_material[32..48].copy_from_slice(&key);

        let mut receiver_material = [0u8; SESSION_KEY_MATERIAL_LEN];
        receiver_material[0..16].copy_from_slice(&d_iv);
        receiver_material[16..32].copy_from_slice(&e_iv);
        receiver_material[32..48].copy_from_slice(&key);

        let mut sender = CryptoState::new([0u8; 32]);
        sender.init_session_keys(&sender_material);
        let mut receiver = CryptoState::new([0u8; 32]);
        receiver.init_session_keys(&receiver_material);

        for chunk in &chunks {
            if chunk.is_empty() {
                continue;
            }
            let mut buf = fakio::buffer::Buffer::with_capacity(chunk.len());
            buf.writable_mut()[..chunk.len()].copy_from_slice(chunk);
            buf.advance_write(chunk.len());

            sender.encrypt(&mut buf);
            receiver.decrypt(&mut buf);
            prop_assert_eq!(buf.readable(), chunk.as_slice());
        }
    }

    /// Replaying a captured handshake frame against a fresh decrypt
    /// always recovers the same username and address: there is no
    /// anti-replay check at this layer (`spec.md` §8, stated property,
    /// not a defect to silently fix).
    #[test]
    fn handshake_frame_replay_is_deterministic(
        key in any::<[u8; 32]>(),
        name_len in 1usize..32,
        port in any::<u16>(),
    ) {
        let username: String = (0..name_len).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let address = Address::Domain("example.com".to_string(), port);
        let frame = handshake::build_client_frame(key, &username, &address).unwrap();

        let (first_username, first_address) = handshake::parse_client_frame(key, &frame).unwrap();
        let (second_username, second_address) = handshake::parse_client_frame(key, &frame).unwrap();

        prop_assert_eq!(&first_username, &username);
        prop_assert_eq!(first_username, second_username);
        prop_assert_eq!(first_address, second_address);
        prop_assert_eq!(address, second_address);
    }
}
