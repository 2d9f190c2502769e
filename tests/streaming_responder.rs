//! Streaming responder over real loopback TCP.

mod common;

use camnode::camera::FramePool;
use camnode::config::StreamingConfig;
use camnode::control::StreamToggle;
use camnode::rtsp::{StreamStats, StreamingResponder};
use camnode::shutdown::StopSignal;
use common::{eventually, read_head, read_response, StaticCamera};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Harness {
    addr: SocketAddr,
    stop: StopSignal,
    toggle: StreamToggle,
    stats: Arc<StreamStats>,
    pool: FramePool,
    slots: camnode::rtsp::SessionSlots,
    server: JoinHandle<()>,
}

async fn start(max_clients: usize) -> Harness {
    let config = StreamingConfig {
        bind_ip: "127.0.0.1".to_string(),
        port: 0,
        max_clients,
        frame_interval_ms: 10,
        ..Default::default()
    };
    let pool = FramePool::start(Box::new(StaticCamera), 4).unwrap();
    let toggle = StreamToggle::new(true);
    let stats = Arc::new(StreamStats::default());
    let stop = StopSignal::new();

    let responder = StreamingResponder::bind(
        &config,
        pool.clone(),
        toggle.clone(),
        Arc::clone(&stats),
        stop.clone(),
    )
    .await
    .unwrap();
    let addr = responder.local_addr().unwrap();
    let slots = responder.slots();
    let server = tokio::spawn(responder.serve());

    Harness {
        addr,
        stop,
        toggle,
        stats,
        pool,
        slots,
        server,
    }
}

async fn options(addr: SocketAddr, cseq: u32) -> (TcpStream, String) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("OPTIONS * RTSP/1.0\r\nCSeq: {}\r\n\r\n", cseq).as_bytes())
        .await
        .unwrap();
    let response = timeout(Duration::from_secs(2), read_head(&mut client))
        .await
        .expect("response in time");
    (client, response)
}

/// True when the server closed the connection without answering.
async fn closed_by_server(client: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    match timeout(Duration::from_secs(2), client.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

#[tokio::test]
async fn test_fourth_client_is_rejected() {
    let harness = start(3).await;

    let mut admitted = Vec::new();
    for cseq in 1..=3 {
        let (client, response) = options(harness.addr, cseq).await;
        assert!(response.starts_with("RTSP/1.0 200 OK\r\n"), "{}", response);
        admitted.push(client);
    }
    assert_eq!(harness.slots.active(), 3);

    let mut fourth = TcpStream::connect(harness.addr).await.unwrap();
    let _ = fourth.write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 4\r\n\r\n").await;
    assert!(closed_by_server(&mut fourth).await);

    let stats = harness.stats.snapshot();
    assert_eq!(stats.accepted, 3);
    assert_eq!(stats.rejected, 1);
    assert_eq!(harness.slots.active(), 3);

    harness.stop.stop();
    drop(admitted);
    timeout(Duration::from_secs(2), harness.server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_slot_frees_on_disconnect() {
    let harness = start(1).await;

    let (first, _) = options(harness.addr, 1).await;
    assert_eq!(harness.slots.active(), 1);

    drop(first);
    let slots = harness.slots.clone();
    assert!(eventually(|| slots.active() == 0).await);

    let (_second, response) = options(harness.addr, 1).await;
    assert!(response.starts_with("RTSP/1.0 200 OK\r\nCSeq: 1\r\n"));
    assert_eq!(harness.stats.snapshot().rejected, 0);

    harness.stop.stop();
}

#[tokio::test]
async fn test_disabled_streaming_refuses_clients() {
    let harness = start(3).await;
    harness.toggle.disable();

    let mut client = TcpStream::connect(harness.addr).await.unwrap();
    assert!(closed_by_server(&mut client).await);
    assert_eq!(harness.stats.snapshot().rejected, 1);
    assert_eq!(harness.slots.active(), 0);

    harness.stop.stop();
}

#[tokio::test]
async fn test_play_streams_multipart_frames() {
    let harness = start(3).await;
    let mut client = TcpStream::connect(harness.addr).await.unwrap();

    client
        .write_all(b"DESCRIBE rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 1\r\n\r\n")
        .await
        .unwrap();
    let describe = read_response(&mut client).await;
    assert!(describe.contains("m=video 0 RTP/AVP 26\r\n"), "{}", describe);
    assert!(describe.contains("c=IN IP4 127.0.0.1\r\n"));

    client
        .write_all(b"SETUP rtsp://127.0.0.1/stream/track1 RTSP/1.0\r\nCSeq: 2\r\n\r\n")
        .await
        .unwrap();
    let setup = read_head(&mut client).await;
    let id = setup
        .lines()
        .find_map(|l| l.strip_prefix("Session: "))
        .unwrap()
        .to_string();

    let play_request = format!(
        "PLAY rtsp://127.0.0.1/stream RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
        id
    );
    client.write_all(play_request.as_bytes()).await.unwrap();
    let play = read_head(&mut client).await;
    assert!(play.starts_with("RTSP/1.0 200 OK\r\nCSeq: 3\r\n"));

    let mut stream = Vec::new();
    let mut buf = [0u8; 4096];
    let received = timeout(Duration::from_secs(5), async {
        while String::from_utf8_lossy(&stream).matches("--frame\r\n").count() < 3 {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream ended early");
            stream.extend_from_slice(&buf[..n]);
        }
    })
    .await;
    assert!(received.is_ok(), "three frames within five seconds");

    let text = String::from_utf8_lossy(&stream);
    assert!(text.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: "));
    assert!(harness.stats.snapshot().frames_pushed >= 3);

    drop(client);
    let pool = harness.pool.clone();
    assert!(eventually(|| pool.outstanding() == 0).await);
    harness.stop.stop();
}
