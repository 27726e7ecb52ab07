//! Loopback helpers for driving a full redirector in tests.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep};

use l4redir::config::{Config, parse_port_map};

pub const BACKEND_TOKEN: &str = "backend-token";
pub const MONITOR_TOKEN: &str = "monitor-token";

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn config(listen_port: u16, backend: SocketAddr, control_plane: &str) -> Config {
    let port_map = format!(
        r#"{{"{listen_port}": ["{}", {}]}}"#,
        backend.ip(),
        backend.port()
    );
    Config {
        control_plane_url: control_plane.to_string(),
        backend_api_token: BACKEND_TOKEN.to_string(),
        monitor_api_token: MONITOR_TOKEN.to_string(),
        router: parse_port_map(&port_map).unwrap(),
        listen_host: Ipv4Addr::LOCALHOST.into(),
        monitor_addr: (Ipv4Addr::LOCALHOST, 0).into(),
        workers_per_port: 2,
    }
}

/// Backend that echoes every byte back, optionally after a delay per connection.
pub async fn spawn_echo_backend(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                sleep(delay).await;
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Backend that reads `expect` bytes, hands them to the test and answers with `reply`.
pub async fn spawn_reply_backend(
    expect: usize,
    reply: &'static [u8],
) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = vec![0u8; expect];
        stream.read_exact(&mut received).await.unwrap();
        let _ = tx.send(received);
        stream.write_all(reply).await.unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });
    (addr, rx)
}

pub async fn status(monitor: SocketAddr) -> serde_json::Value {
    reqwest::Client::new()
        .get(format!("http://{monitor}/status"))
        .bearer_auth(MONITOR_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Poll `/status` until `check` passes or two seconds elapse.
pub async fn wait_for_status(
    monitor: SocketAddr,
    check: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let current = status(monitor).await;
        if check(&current) || Instant::now() >= deadline {
            return current;
        }
        sleep(Duration::from_millis(20)).await;
    }
}
