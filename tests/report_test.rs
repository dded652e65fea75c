// Report channel against a fake collection server on loopback.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use netpulse_engine::config::AgentConfig;
use netpulse_engine::engine::report::{ReportChannel, ServerConfig};
use netpulse_engine::wire::frame::{Frame, FrameBuffer, MessageType};
use netpulse_engine::wire::payload::BatteryStatus;
use netpulse_engine::wire::SessionIds;
use netpulse_engine::{AgentError, Platform};

fn ids() -> SessionIds {
    SessionIds {
        device_id: "abcdef".to_string(),
        session_id: 1_234,
        app_id: 3,
        platform: 1,
    }
}

fn config(port: u16) -> AgentConfig {
    AgentConfig {
        server_host: "127.0.0.1".to_string(),
        report_port: port,
        connect_timeout_ms: 2_000,
        init_delay_ms: 10,
        resource_interval_ms: 50,
        ..AgentConfig::default()
    }
}

async fn read_frame(conn: &mut TcpStream, buffer: &mut FrameBuffer) -> Option<Frame> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(frame) = buffer.next_frame() {
            return Some(frame.unwrap());
        }
        match conn.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buffer.extend(&chunk[..n]),
        }
    }
}

/// Accept one channel, answer the open frame with `announce` and forward every later frame.
async fn fake_server(announce: &'static [u8]) -> (u16, mpsc::UnboundedReceiver<Frame>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buffer = FrameBuffer::new();
        let Some(open) = read_frame(&mut conn, &mut buffer).await else {
            return;
        };
        let _ = tx.send(open);
        conn.write_all(announce).await.unwrap();

        while let Some(frame) = read_frame(&mut conn, &mut buffer).await {
            if tx.send(frame).is_err() {
                return;
            }
        }
    });
    (port, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

fn no_app_char_id() -> Arc<Mutex<Option<String>>> {
    Arc::new(Mutex::new(None))
}

#[tokio::test]
async fn test_handshake_then_sequenced_resources() {
    let (port, mut rx) =
        fake_server(br#"{"resourceInterval":50,"measurmentProbability":1}"#).await;
    let app_char_id = Arc::new(Mutex::new(Some("com.example.player".to_string())));
    let channel = ReportChannel::open(
        &config(port),
        ids(),
        Platform::detached().resources,
        app_char_id,
    );

    let open = next(&mut rx).await;
    assert_eq!(open.message_type, MessageType::SessionOpen);
    assert_eq!(open.payload, "1");
    assert_eq!(open.session_id, 1_234);
    assert_eq!(open.device_id, "abcdef");

    let info = next(&mut rx).await;
    assert_eq!(info.message_type, MessageType::SystemInfo);
    assert_eq!(info.sequence, None);

    let mut resource_seqs = Vec::new();
    let mut app_uid = None;
    while resource_seqs.len() < 2 {
        let frame = next(&mut rx).await;
        match frame.message_type {
            MessageType::Resource => resource_seqs.push(frame.sequence.unwrap()),
            MessageType::AppUid => app_uid = Some(frame.payload),
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(resource_seqs, vec![1, 2]);
    assert_eq!(app_uid.as_deref(), Some("com.example.player"));

    assert!(channel.is_sampled_in());
    assert_eq!(
        channel.server_config(),
        Some(ServerConfig {
            resource_interval: Duration::from_millis(50),
            measurement_probability: 1.0,
        })
    );
    channel.close().await;
    assert!(!channel.is_running());
}

#[tokio::test]
async fn test_garbage_config_falls_back() {
    let (port, mut rx) = fake_server(b"not a config").await;
    let config = config(port);
    let channel = ReportChannel::open(&config, ids(), Platform::detached().resources, no_app_char_id());

    assert_eq!(next(&mut rx).await.message_type, MessageType::SessionOpen);
    assert_eq!(next(&mut rx).await.message_type, MessageType::SystemInfo);
    assert_eq!(
        channel.server_config(),
        Some(ServerConfig::fallback(&config))
    );
    assert!(channel.is_running());
    channel.close().await;
}

#[tokio::test]
async fn test_battery_frames_only_on_change() {
    let (port, mut rx) =
        fake_server(br#"{"resourceInterval":60000,"measurmentProbability":1}"#).await;
    let channel = ReportChannel::open(
        &config(port),
        ids(),
        Platform::detached().resources,
        no_app_char_id(),
    );
    next(&mut rx).await;
    next(&mut rx).await;

    for _ in 0..100 {
        if channel.is_sampled_in() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(channel.is_sampled_in());

    let mut status = BatteryStatus {
        level: 55,
        scale: 100,
        temperature: 300,
        voltage: 3900,
        health: 2,
        technology: "Li-ion".to_string(),
        plugged: 0,
    };
    assert!(channel.send_battery(&status).await.unwrap());
    assert!(!channel.send_battery(&status).await.unwrap());
    status.plugged = 2;
    assert!(channel.send_battery(&status).await.unwrap());

    let mut last_seq = 0;
    let mut batteries = 0;
    while batteries < 2 {
        let frame = next(&mut rx).await;
        if let Some(seq) = frame.sequence {
            assert!(seq > last_seq);
            last_seq = seq;
        }
        if frame.message_type == MessageType::Battery {
            batteries += 1;
        }
    }
    channel.close().await;
}

#[tokio::test]
async fn test_unreachable_server_stops_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let channel = ReportChannel::open(
        &config(port),
        ids(),
        Platform::detached().resources,
        no_app_char_id(),
    );
    let result = channel.send_location("1@2@US@CA".to_string()).await;
    assert!(matches!(result, Err(AgentError::NotRunning)));
    assert!(!channel.is_running());
    assert!(matches!(
        channel.send_periodic_stats(String::new()).await,
        Err(AgentError::NotRunning)
    ));
    assert_eq!(channel.frames_sent(), 0);
}

#[tokio::test]
async fn test_sends_fail_after_server_goes_away() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buffer = FrameBuffer::new();
        read_frame(&mut conn, &mut buffer).await;
        conn.write_all(br#"{"resourceInterval":60000,"measurmentProbability":0}"#)
            .await
            .unwrap();
    });

    let channel = ReportChannel::open(
        &config(port),
        ids(),
        Platform::detached().resources,
        no_app_char_id(),
    );

    let mut failed = false;
    for _ in 0..100 {
        if channel.send_location("0@0@@".to_string()).await.is_err() {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(failed);
    assert!(!channel.is_running());
    assert!(matches!(
        channel.send_session_close(String::new()).await,
        Err(AgentError::NotRunning)
    ));
}

#[tokio::test]
async fn test_zero_announced_interval_uses_configured_one() {
    let (port, mut rx) =
        fake_server(br#"{"resourceInterval":0,"measurmentProbability":1}"#).await;
    let config = AgentConfig {
        resource_interval_ms: 60_000,
        ..config(port)
    };
    let channel = ReportChannel::open(&config, ids(), Platform::detached().resources, no_app_char_id());

    assert_eq!(next(&mut rx).await.message_type, MessageType::SessionOpen);
    assert_eq!(next(&mut rx).await.message_type, MessageType::SystemInfo);
    let first = next(&mut rx).await;
    assert_eq!(first.message_type, MessageType::Resource);
    assert_eq!(first.sequence, Some(1));

    // The next sample is a minute away, not immediate.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(channel.sequence(), 1);
    channel.close().await;
}

#[tokio::test]
async fn test_send_behind_silent_handshake_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buffer = FrameBuffer::new();
        // Read the open frame and everything after it, never announce a config.
        while read_frame(&mut conn, &mut buffer).await.is_some() {}
    });

    let config = AgentConfig {
        connect_timeout_ms: 300,
        ..config(port)
    };
    let channel = ReportChannel::open(&config, ids(), Platform::detached().resources, no_app_char_id());

    let result = tokio::time::timeout(
        Duration::from_secs(3),
        channel.send_session_close("0@0@0@0@0@0$$$$".to_string()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(AgentError::SendTimeout(_))));
    assert!(!channel.is_running());
    assert_eq!(channel.server_config(), None);
    assert!(matches!(
        channel.send_location("0@0@@".to_string()).await,
        Err(AgentError::NotRunning)
    ));

    tokio::time::timeout(Duration::from_secs(3), channel.close())
        .await
        .unwrap();
}
