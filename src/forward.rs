use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, instrument, warn};

use crate::router::{Backend, PortRouter};
use crate::stats::GlobalStats;
use crate::supervisor::ShutdownRx;
use crate::telemetry::{L2nRecord, Record, Telemetry, WebRecord};

pub const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(300);
const LISTEN_BACKLOG: u32 = 1024;
const PUMP_BUFFER_SIZE: usize = 16 * 1024;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const REUSE_PORT_SUPPORTED: bool =
    cfg!(all(unix, not(target_os = "solaris"), not(target_os = "illumos")));

/// State every forwarding worker shares.
#[derive(Clone)]
pub struct WorkerContext {
    pub router: PortRouter,
    pub telemetry: Telemetry,
    pub stats: Arc<GlobalStats>,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerId {
    pub port: u16,
    pub id: u32,
}

/// Bind `workers` accept sockets for one listen address.
///
/// Where the platform supports `SO_REUSEPORT` every worker gets its own socket and the kernel
/// spreads connections across them; elsewhere one socket is shared by all workers.
pub fn bind_port(addr: SocketAddr, workers: usize) -> Result<Vec<Arc<TcpListener>>> {
    if REUSE_PORT_SUPPORTED {
        (0..workers)
            .map(|_| bind_listener(addr, true).map(Arc::new))
            .collect()
    } else {
        let shared = Arc::new(bind_listener(addr, false)?);
        Ok(vec![shared; workers])
    }
}

fn bind_listener(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("failed to create listener socket")?;
    socket
        .set_reuseaddr(true)
        .context("failed setting SO_REUSEADDR")?;
    if reuse_port {
        set_reuseport(&socket).context("failed setting SO_REUSEPORT")?;
    }
    socket
        .bind(addr)
        .with_context(|| format!("failed to bind {addr}"))?;
    socket
        .listen(LISTEN_BACKLOG)
        .with_context(|| format!("failed to listen on {addr}"))
}

#[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
fn set_reuseport(socket: &TcpSocket) -> io::Result<()> {
    socket.set_reuseport(true)
}

#[cfg(not(all(unix, not(target_os = "solaris"), not(target_os = "illumos"))))]
fn set_reuseport(_socket: &TcpSocket) -> io::Result<()> {
    Ok(())
}

/// Spawn one accept worker. Each accepted client is bridged to the port's backend on its own
/// task, so a failing connection never takes the worker down.
pub fn spawn_worker(
    listener: Arc<TcpListener>,
    worker: WorkerId,
    ctx: WorkerContext,
    shutdown: ShutdownRx,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move { accept_loop(listener, worker, ctx, shutdown).await })
}

#[instrument(skip_all, fields(port = worker.port, worker_id = worker.id))]
async fn accept_loop(
    listener: Arc<TcpListener>,
    worker: WorkerId,
    ctx: WorkerContext,
    mut shutdown: ShutdownRx,
) -> Result<()> {
    let backend = ctx
        .router
        .route(worker.port)
        .cloned()
        .with_context(|| format!("no backend routed for port {}", worker.port))?;
    debug!(%backend, "worker accepting");

    loop {
        tokio::select! {
            biased;
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    debug!("shutdown received; stopping worker");
                    break;
                }
            }
            accept_res = listener.accept() => {
                match accept_res {
                    Ok((client, peer)) => {
                        let backend = backend.clone();
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = bridge(client, peer, backend, worker, ctx).await {
                                warn!(peer = %peer, error = %err, "session failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Dial the backend and relay bytes until either side closes, then report both legs.
async fn bridge(
    mut client: TcpStream,
    peer: SocketAddr,
    backend: Backend,
    worker: WorkerId,
    ctx: WorkerContext,
) -> Result<()> {
    let _active = ctx.stats.open_connection();
    let started = Instant::now();
    client.set_nodelay(true).ok();

    let connect = TcpStream::connect((backend.host.as_str(), backend.port));
    let mut upstream = match timeout(BACKEND_CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            ctx.stats.record_backend_connect_failure();
            return Err(err).with_context(|| format!("failed to connect to backend {backend}"));
        }
        Err(_) => {
            ctx.stats.record_backend_connect_failure();
            bail!(
                "backend {backend} did not accept within {}s",
                BACKEND_CONNECT_TIMEOUT.as_secs()
            );
        }
    };
    let latency = started.elapsed();
    upstream.set_nodelay(true).ok();
    let backend_addr = upstream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), backend.port));
    debug!(%peer, %backend_addr, latency_ms = millis(latency), "backend connected");

    let outcome = relay(&mut client, &mut upstream, IDLE_READ_TIMEOUT).await;
    drop(client);
    drop(upstream);

    let duration = started.elapsed();
    ctx.stats.record_bytes(outcome.bytes_in, outcome.bytes_out);
    match &outcome.error {
        Some(err) => debug!(%peer, error = %err, "connection torn down"),
        None => debug!(
            %peer,
            bytes_in = outcome.bytes_in,
            bytes_out = outcome.bytes_out,
            "connection closed"
        ),
    }

    let timestamp = Utc::now();
    let duration_ms = millis(duration);
    ctx.telemetry.record(
        worker.port,
        Record::Web(WebRecord {
            timestamp,
            client_ip: peer.ip(),
            client_port: peer.port(),
            duration_ms,
            worker_id: worker.id,
        }),
    );
    ctx.telemetry.record(
        worker.port,
        Record::L2n(L2nRecord {
            timestamp,
            backend_ip: backend_addr.ip(),
            backend_port: backend_addr.port(),
            latency_ms: millis(latency),
            duration_ms,
            worker_id: worker.id,
        }),
    );
    Ok(())
}

#[derive(Debug, Default)]
struct RelayOutcome {
    bytes_in: u64,
    bytes_out: u64,
    error: Option<io::Error>,
}

/// Pump both directions concurrently. The first direction to finish, by EOF, error or idle
/// timeout, ends the whole relay.
async fn relay(client: &mut TcpStream, upstream: &mut TcpStream, idle: Duration) -> RelayOutcome {
    let (mut client_rd, mut client_wr) = client.split();
    let (mut upstream_rd, mut upstream_wr) = upstream.split();
    let mut bytes_in = 0u64;
    let mut bytes_out = 0u64;

    let result = tokio::select! {
        res = pump(&mut client_rd, &mut upstream_wr, idle, &mut bytes_in) => res,
        res = pump(&mut upstream_rd, &mut client_wr, idle, &mut bytes_out) => res,
    };

    RelayOutcome {
        bytes_in,
        bytes_out,
        error: result.err(),
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no data for {}s", idle.as_secs()),
                ));
            }
        };
        if n == 0 {
            writer.shutdown().await.ok();
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn pump_copies_until_eof() {
        let (mut near, mut far) = duplex(64);
        let (mut sink_writer, mut sink_reader) = duplex(1024);

        near.write_all(b"hello redirector").await.unwrap();
        near.shutdown().await.unwrap();

        let mut copied = 0;
        pump(&mut far, &mut sink_writer, IDLE_READ_TIMEOUT, &mut copied)
            .await
            .unwrap();
        drop(sink_writer);

        let mut received = Vec::new();
        sink_reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello redirector");
        assert_eq!(copied, 16);
    }

    #[tokio::test(start_paused = true)]
    async fn pump_gives_up_after_idle_timeout() {
        let (_near, mut far) = duplex(64);
        let (mut sink, _sink_reader) = duplex(64);

        let started = Instant::now();
        let mut copied = 0;
        let err = pump(&mut far, &mut sink, IDLE_READ_TIMEOUT, &mut copied)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= IDLE_READ_TIMEOUT);
        assert_eq!(copied, 0);
    }

    #[tokio::test]
    async fn reuseport_workers_share_one_port() {
        let listeners = bind_port("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        let addr = listeners[0].local_addr().unwrap();
        drop(listeners);

        let listeners = bind_port(addr, 4).unwrap();
        assert_eq!(listeners.len(), 4);
        for listener in &listeners {
            assert_eq!(listener.local_addr().unwrap(), addr);
        }
    }
}
