//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use tcp_lifecycle::net::{handler_fn, RequestHandler};

/// Echo every byte back until the peer closes.
pub fn echo_handler() -> RequestHandler {
    handler_fn(|mut conn| async move {
        let mut buf = [0u8; 1024];
        loop {
            match conn.stream().read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if conn.stream().write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Counts entries, then never returns.
#[allow(dead_code)]
pub fn stalling_handler(entered: Arc<AtomicUsize>) -> RequestHandler {
    handler_fn(move |_conn| {
        let entered = Arc::clone(&entered);
        async move {
            entered.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await
        }
    })
}

/// Send `payload` and expect it echoed back.
pub async fn assert_echo(addr: SocketAddr, payload: &[u8]) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

/// Poll `condition` until it holds or two seconds pass.
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
