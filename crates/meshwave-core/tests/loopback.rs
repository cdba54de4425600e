//! Integration test: a hub and two peers over real loopback TCP, exercising
//! chat routing and a chunked file transfer end to end.

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use meshwave_core::{ChatEvent, Hub, Peer};

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn free_port_pair() -> (u16, u16) {
    let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    (a, b)
}

fn wait_for<T>(timeout: Duration, mut poll: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(v) = poll() {
            return Some(v);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn chat_routes_between_two_peers_through_hub() {
    let (data_port, disc_port) = free_port_pair();
    let hub = Arc::new(Hub::new());
    hub.start("test-hub", data_port, disc_port).expect("hub start");

    let addr: SocketAddr = format!("127.0.0.1:{data_port}").parse().unwrap();
    let dir = std::env::temp_dir().join(format!("meshwave_chat_test_{data_port}"));
    let _ = fs::create_dir_all(&dir);

    let alice = Peer::new(dir.clone());
    let bob = Peer::new(dir.clone());
    alice.connect(addr, "alice").expect("alice connect");
    bob.connect(addr, "bob").expect("bob connect");

    // Give the hub's HELLO handshake a moment to register both names.
    std::thread::sleep(Duration::from_millis(100));

    alice.send_chat("bob", "hello from alice").expect("send_chat");

    let event = wait_for(Duration::from_secs(2), || bob.poll_event());
    match event {
        Some(ChatEvent::Chat { from, text, .. }) => {
            assert_eq!(from, "alice");
            assert_eq!(text, "hello from alice");
        }
        other => panic!("expected a Chat event, got {other:?}"),
    }

    alice.disconnect();
    bob.disconnect();
    hub.stop();
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn file_transfer_completes_across_chunk_boundary() {
    let (data_port, disc_port) = free_port_pair();
    let hub = Arc::new(Hub::new());
    hub.start("test-hub", data_port, disc_port).expect("hub start");

    let addr: SocketAddr = format!("127.0.0.1:{data_port}").parse().unwrap();
    let dir = std::env::temp_dir().join(format!("meshwave_xfer_test_{data_port}"));
    let alice_dir = dir.join("alice");
    let bob_dir = dir.join("bob");
    let _ = fs::create_dir_all(&alice_dir);
    let _ = fs::create_dir_all(&bob_dir);

    let alice = Peer::new(alice_dir.clone());
    let bob = Peer::new(bob_dir.clone());
    alice.connect(addr, "alice").expect("alice connect");
    bob.connect(addr, "bob").expect("bob connect");
    std::thread::sleep(Duration::from_millis(100));

    let input_path = alice_dir.join("input.bin");
    let file_size = meshwave_core::wire::CHUNK_SIZE * 2 + 17;
    {
        let mut f = fs::File::create(&input_path).unwrap();
        let data: Vec<u8> = (0..file_size).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
    }

    let xfer_id = alice.send_file(input_path.to_str().unwrap(), "bob").expect("send_file");

    let completed = wait_for(Duration::from_secs(5), || {
        bob.transfers()
            .into_iter()
            .find(|t| t.id == xfer_id && t.state == meshwave_core::XferState::Done)
    });
    assert!(completed.is_some(), "transfer did not complete in time");

    let output_path = bob_dir.join("input.bin");
    let input_data = fs::read(&input_path).unwrap();
    let output_data = fs::read(&output_path).unwrap();
    assert_eq!(input_data, output_data);
    assert_eq!(output_data.len() as u64, file_size as u64);
    assert_eq!(sha256_hex(&input_data), sha256_hex(&output_data));

    alice.disconnect();
    bob.disconnect();
    hub.stop();
    let _ = fs::remove_dir_all(&dir);
}
