//! Host-side vsock handshake tests against a mock firecracker UDS proxy.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::time::Duration;

use firevisor::components::vsock::{dial_with_config, DialConfig, VsockError};

fn test_dir(tag: &str) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = std::env::temp_dir().join(format!("firevisor-vsock-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn quick_config() -> DialConfig {
    DialConfig {
        retry_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_handshake_succeeds() {
    let dir = test_dir("ok");
    let socket = dir.join("v.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "CONNECT 10000\n");
        write_half.write_all(b"OK 49152\n").await.unwrap();
    });

    dial_with_config(&socket, 10000, quick_config())
        .await
        .expect("dial failed");
    server.await.unwrap();

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_handshake_empty_port_ack_succeeds() {
    let dir = test_dir("emptyport");
    let socket = dir.join("v.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        // an ack with an empty port is still an ack
        write_half.write_all(b"OK \n").await.unwrap();
    });

    dial_with_config(&socket, 1, quick_config())
        .await
        .expect("dial failed on empty-port ack");
    server.await.unwrap();

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_bad_ack_is_reported() {
    let dir = test_dir("badack");
    let socket = dir.join("v.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    // every retried attempt gets the same rejection
    let server = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await;
            let _ = write_half.write_all(b"ERR\n").await;
        }
    });

    let config = DialConfig {
        retry_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let err = dial_with_config(&socket, 10000, config).await.unwrap_err();
    assert!(matches!(err, VsockError::Ack(..)), "unexpected error: {err}");

    server.abort();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_dial_timeout_without_listener() {
    let dir = test_dir("nolistener");
    let socket = dir.join("never-bound.sock");

    let config = DialConfig {
        retry_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let err = dial_with_config(&socket, 10000, config).await.unwrap_err();
    assert!(err.is_temporary());
    assert!(
        matches!(err, VsockError::DialTimeout(..)),
        "unexpected error: {err}"
    );

    std::fs::remove_dir_all(&dir).ok();
}
