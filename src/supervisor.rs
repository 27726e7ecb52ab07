use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::forward::{self, WorkerContext, WorkerId};
use crate::monitor::{self, MonitorState};
use crate::stats::GlobalStats;
use crate::telemetry::{self, Telemetry, TelemetryBuffer, TelemetryClient};

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub type ShutdownRx = watch::Receiver<bool>;
pub type ShutdownTx = watch::Sender<bool>;

pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// A started redirector: monitoring API, telemetry flusher and every forwarding worker.
pub struct Redirector {
    shutdown_tx: ShutdownTx,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
    monitor_addr: SocketAddr,
    listen_addrs: Vec<SocketAddr>,
}

impl Redirector {
    /// Bind every socket, then spawn the monitoring API followed by the workers.
    ///
    /// Nothing is spawned unless every bind succeeded, so a failed start leaves no listener open.
    pub async fn start(config: Config) -> Result<Self> {
        let stats = Arc::new(GlobalStats::default());
        let breaker = Arc::new(CircuitBreaker::default());
        let client = TelemetryClient::new(
            &config.control_plane_url,
            &config.backend_api_token,
            Arc::clone(&breaker),
            Arc::clone(&stats),
        )?;
        let telemetry = Telemetry::new(TelemetryBuffer::default(), client);

        let monitor_listener = TcpListener::bind(config.monitor_addr)
            .await
            .with_context(|| {
                format!("failed to bind monitoring API on {}", config.monitor_addr)
            })?;
        let monitor_addr = monitor_listener.local_addr()?;

        let mut bound = Vec::with_capacity(config.router.len());
        for port in config.router.ports() {
            let addr = SocketAddr::new(config.listen_host, port);
            bound.push((port, addr, forward::bind_port(addr, config.workers_per_port)?));
        }

        let (shutdown_tx, shutdown_rx) = shutdown_channel();
        let mut tasks = Vec::new();

        let state = MonitorState::new(
            &config.monitor_api_token,
            Arc::clone(&stats),
            Arc::clone(&breaker),
        );
        tasks.push((
            "monitor".to_string(),
            tokio::spawn(monitor::serve(monitor_listener, state, shutdown_rx.clone())),
        ));
        info!(%monitor_addr, "monitoring API listening");

        let ctx = WorkerContext {
            router: config.router.clone(),
            telemetry: telemetry.clone(),
            stats,
        };
        let mut listen_addrs = Vec::with_capacity(bound.len());
        for (index, (port, addr, listeners)) in bound.into_iter().enumerate() {
            let backend = config.router.route(port).map(ToString::to_string);
            info!(
                %addr,
                backend = backend.as_deref().unwrap_or_default(),
                workers = listeners.len(),
                "forwarding"
            );
            for (n, listener) in listeners.into_iter().enumerate() {
                let worker = WorkerId {
                    port,
                    id: (index * config.workers_per_port + n) as u32,
                };
                tasks.push((
                    format!("worker {port}/{n}"),
                    forward::spawn_worker(listener, worker, ctx.clone(), shutdown_rx.clone()),
                ));
            }
            listen_addrs.push(addr);
        }

        tasks.push((
            "telemetry flusher".to_string(),
            telemetry::spawn_flusher(telemetry, shutdown_rx),
        ));

        Ok(Self {
            shutdown_tx,
            tasks,
            monitor_addr,
            listen_addrs,
        })
    }

    pub fn monitor_addr(&self) -> SocketAddr {
        self.monitor_addr
    }

    pub fn listen_addrs(&self) -> &[SocketAddr] {
        &self.listen_addrs
    }

    /// Signal every task to stop and wait up to [`SHUTDOWN_GRACE`] for each, aborting stragglers.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let results = join_all(self.tasks.into_iter().map(|(name, mut handle)| async move {
            match timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(res)) => res.with_context(|| format!("{name} failed")),
                Ok(Err(join_err)) => {
                    Err(anyhow::Error::new(join_err).context(format!("{name} did not complete")))
                }
                Err(_) => {
                    warn!(task = %name, "task did not stop in time; aborting");
                    handle.abort();
                    Ok(())
                }
            }
        }))
        .await;

        let mut first_err = None;
        for res in results {
            if let Err(err) = res {
                let chain = format!("{err:#}");
                error!(error = %chain, "task ended with error");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => {
                info!("redirector stopped");
                Ok(())
            }
        }
    }
}

/// Start the redirector and run it until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let redirector = Redirector::start(config).await?;
    let received = wait_for_shutdown_signal().await;
    info!(signal = received, "shutdown signal received");
    redirector.shutdown().await
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    name = ctrl_c() => name,
                    _ = terminate.recv() => "SIGTERM",
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                ctrl_c().await
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> &'static str {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl_c");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
