//! Instance hand-off tests over real loopback sockets
//!
//! A [`PlaybackServer`] is wired to a bare command channel so the tests see
//! exactly which commands a request produces.

mod helpers;

use cadenza_common::PlaybackSource;
use cadenza_player::instance::client::forward_request;
use cadenza_player::instance::protocol::{encode_entries, encode_request, protocol_identity, PROTOCOL_VERSION};
use cadenza_player::instance::{PlaybackServer, ServerSettings};
use cadenza_player::player::{PlayerCommand, PlayerHandle, COMMAND_CAPACITY};
use helpers::audio_file;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> (PlaybackServer, mpsc::Receiver<PlayerCommand>) {
    let (handle, rx) = PlayerHandle::channel(COMMAND_CAPACITY);
    let listener = PlaybackServer::bind().await.unwrap();
    let server = PlaybackServer::spawn(listener, handle, ServerSettings::default()).unwrap();
    (server, rx)
}

/// Write `bytes` and close; the server may reset a connection it rejects
async fn send_raw(port: u16, bytes: &[u8]) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let _ = stream.write_all(bytes).await;
    let _ = stream.shutdown().await;
}

async fn next_command(rx: &mut mpsc::Receiver<PlayerCommand>) -> PlayerCommand {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no command arrived")
        .expect("command channel closed")
}

/// Wait for Activate followed by `count` enqueues
async fn expect_request(rx: &mut mpsc::Receiver<PlayerCommand>, count: usize) -> Vec<PlaybackSource> {
    assert!(matches!(next_command(rx).await, PlayerCommand::Activate));
    let mut sources = Vec::new();
    for _ in 0..count {
        match next_command(rx).await {
            PlayerCommand::Enqueue(source) => sources.push(source),
            other => panic!("expected Enqueue, got {:?}", other),
        }
    }
    sources
}

async fn assert_quiet(rx: &mut mpsc::Receiver<PlayerCommand>) {
    if let Ok(Some(command)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
        panic!("unexpected command {:?}", command);
    }
}

#[tokio::test]
async fn test_forwarded_request_arrives_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let first = audio_file(dir.path(), "01 first.flac");
    let second = audio_file(dir.path(), "02 zweite ünïcode.mp3");
    let sources = vec![
        PlaybackSource::file(&first),
        PlaybackSource::web("https://radio.example/stream?id=7"),
        PlaybackSource::file(&second),
    ];

    let (server, mut rx) = start_server().await;
    forward_request(server.port(), &sources, WAIT).await.unwrap();

    assert_eq!(expect_request(&mut rx, 3).await, sources);
    assert_quiet(&mut rx).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_identity_dropped_and_server_keeps_serving() {
    let (server, mut rx) = start_server().await;

    let foreign = encode_entries(0x0123_4567_89ab_cdef, PROTOCOL_VERSION, &[]);
    send_raw(server.port(), &foreign).await;
    send_raw(server.port(), b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert_quiet(&mut rx).await;

    let radio = PlaybackSource::web("http://radio.example/live");
    forward_request(server.port(), std::slice::from_ref(&radio), WAIT).await.unwrap();
    assert_eq!(expect_request(&mut rx, 1).await, vec![radio]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_version_mismatch_dropped() {
    let (server, mut rx) = start_server().await;

    let future_client = encode_entries(protocol_identity(), PROTOCOL_VERSION + 1, &[]);
    send_raw(server.port(), &future_client).await;
    assert_quiet(&mut rx).await;

    forward_request(server.port(), &[], WAIT).await.unwrap();
    assert!(expect_request(&mut rx, 0).await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_truncated_request_keeps_entries_already_read() {
    let (server, mut rx) = start_server().await;
    let first = PlaybackSource::web("http://radio.example/one");
    let bytes = encode_request(&[first.clone(), PlaybackSource::web("http://radio.example/two")]);

    send_raw(server.port(), &bytes[..bytes.len() - 3]).await;
    assert_eq!(expect_request(&mut rx, 1).await, vec![first]);
    assert_quiet(&mut rx).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_negative_count_dropped_after_activation() {
    let (server, mut rx) = start_server().await;
    let mut bytes = encode_request(&[]);
    bytes[12..16].copy_from_slice(&(-5i32).to_le_bytes());

    send_raw(server.port(), &bytes).await;
    assert!(expect_request(&mut rx, 0).await.is_empty());
    assert_quiet(&mut rx).await;

    server.shutdown().await;
}
