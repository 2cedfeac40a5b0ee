//! Firehose source against a local WebSocket relay.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopy_connectors::firehose::{
    ConnectionState, FirehoseMessage, FirehoseSource, FirehoseSourceConfig, ReconnectConfig,
    SharedCursor, SourceEvent,
};
use futures_util::SinkExt;
use minicbor::Encoder;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

fn commit_frame(seq: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2).unwrap();
    enc.str("op").unwrap().i64(1).unwrap();
    enc.str("t").unwrap().str("#commit").unwrap();
    enc.map(4).unwrap();
    enc.str("repo").unwrap().str("did:example:alice").unwrap();
    enc.str("seq").unwrap().u64(seq).unwrap();
    enc.str("time").unwrap().str("2024-05-01T12:00:00Z").unwrap();
    enc.str("ops").unwrap().array(0).unwrap();
    buf
}

/// Serves one scripted connection per entry in `sessions`, recording each
/// request URI, then stops accepting.
async fn spawn_relay(sessions: Vec<Vec<Vec<u8>>>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let uris = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&uris);

    tokio::spawn(async move {
        for frames in sessions {
            let (stream, _) = listener.accept().await.unwrap();
            let seen = Arc::clone(&seen);
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                seen.lock().unwrap().push(req.uri().to_string());
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            for frame in frames {
                ws.send(Message::Binary(frame.into())).await.unwrap();
            }
            let _ = ws.close(None).await;
        }
    });

    (format!("ws://{addr}"), uris)
}

fn test_config(url: &str) -> FirehoseSourceConfig {
    let mut config = FirehoseSourceConfig::new(url);
    config.reconnect = ReconnectConfig {
        max_attempts: 1,
        base_delay: Duration::from_millis(10),
    };
    config.connect_timeout = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn test_reconnect_resumes_from_cursor() {
    let (url, uris) = spawn_relay(vec![
        vec![commit_frame(5), b"not cbor".to_vec(), commit_frame(6)],
        vec![commit_frame(7)],
    ])
    .await;

    let cursor = SharedCursor::new(None);
    let mut source = FirehoseSource::new(test_config(&url), cursor.clone());
    source.start().unwrap();

    let mut seqs = Vec::new();
    let mut connects = 0;
    let state_rx = source.state_watch();

    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), source.next_event())
        .await
        .unwrap()
    {
        match event {
            SourceEvent::Connected { .. } => connects += 1,
            SourceEvent::Message(FirehoseMessage::Commit(commit)) => {
                seqs.push(commit.seq);
                cursor.advance(commit.seq);
            }
            SourceEvent::Exhausted { .. } => break,
            _ => {}
        }
    }

    assert_eq!(seqs, vec![5, 6, 7]);
    assert_eq!(connects, 2);

    let uris = uris.lock().unwrap().clone();
    assert_eq!(uris.len(), 2);
    assert_eq!(uris[0], "/subscribe");
    assert_eq!(uris[1], "/subscribe?cursor=6");

    let metrics = source.metrics();
    assert_eq!(metrics.decode_errors, 1);
    assert_eq!(metrics.connects, 2);

    assert_eq!(*state_rx.borrow(), ConnectionState::Stopped);

    source.stop().await;
    assert_eq!(source.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_explicit_cursor_on_first_connect() {
    let (url, uris) = spawn_relay(vec![vec![commit_frame(101)]]).await;

    let mut source = FirehoseSource::new(test_config(&url), SharedCursor::new(Some(100)));
    source.start().unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), source.next_event())
            .await
            .unwrap()
            .unwrap();
        if let SourceEvent::Message(message) = event {
            assert_eq!(message.seq(), Some(101));
            break;
        }
    }
    source.stop().await;

    assert_eq!(uris.lock().unwrap()[0], "/subscribe?cursor=100");
}

#[tokio::test]
async fn test_read_error_signalled_before_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // A frame header with the reserved bits set is a protocol violation.
        ws.get_mut().write_all(&[0xf2, 0x01, 0x00]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut config = test_config(&format!("ws://{addr}"));
    config.reconnect.max_attempts = 0;
    let mut source = FirehoseSource::new(config, SharedCursor::new(None));
    source.start().unwrap();

    let mut seen = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(10), source.next_event())
        .await
        .unwrap()
    {
        match event {
            SourceEvent::Connected { .. } => seen.push("connected".to_string()),
            SourceEvent::Error { message } => {
                assert!(message.contains("read error"), "{message}");
                seen.push("error".to_string());
            }
            SourceEvent::Disconnected { .. } => seen.push("disconnected".to_string()),
            SourceEvent::Exhausted { .. } => {
                seen.push("exhausted".to_string());
                break;
            }
            SourceEvent::Message(message) => panic!("unexpected message {message:?}"),
        }
    }

    assert_eq!(seen, vec!["connected", "error", "disconnected", "exhausted"]);
    source.stop().await;
}
