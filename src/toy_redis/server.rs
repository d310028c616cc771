use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::commands::{handle_connection, ConnectionId, SessionContext};
use super::error::SessionError;
use super::KeyValueStore;
use crate::config::{AcceptErrorPolicy, Config};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts connections and spawns one session task per connection, all
/// sharing a single store.
pub struct Server {
    listener: TcpListener,
    store: KeyValueStore,
    idle_timeout: Duration,
    accept_errors: AcceptErrorPolicy,
    stats_interval: Duration,
    next_id: AtomicU64,
    stats: Arc<SessionStats>,
}

impl Server {
    pub async fn bind(config: &Config) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: &Config) -> Self {
        Self {
            listener,
            store: KeyValueStore::new(),
            idle_timeout: config.idle_timeout(),
            accept_errors: config.accept_errors,
            stats_interval: config.stats_interval(),
            next_id: AtomicU64::new(1),
            stats: Arc::new(SessionStats::default()),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Accepts until a fatal accept error. Never returns `Ok`.
    #[cfg(test)]
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accepts connections until `shutdown` resolves. Sessions that are
    /// already running are left alone.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let reporter = spawn_stats_reporter(
            Arc::clone(&self.stats),
            self.store.clone(),
            self.stats_interval,
        );

        let result = loop {
            select! {
                _ = &mut shutdown => {
                    info!("no longer accepting connections");
                    break Ok(());
                }
                accepted = self.listener.accept() => {
                    if let Err(err) = self.handle_accept_result(accepted).await {
                        break Err(err);
                    }
                }
            }
        };

        if let Some(reporter) = reporter {
            reporter.abort();
        }
        result
    }

    async fn handle_accept_result(&self, result: io::Result<(TcpStream, SocketAddr)>) -> Result<()> {
        match result {
            Ok((socket, peer)) => {
                self.spawn_session(socket, peer);
                Ok(())
            }
            Err(err) if self.accept_errors == AcceptErrorPolicy::Resilient && is_transient(&err) => {
                warn!(error = %err, "transient accept failure, retrying");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "accept failed, stopping server");
                Err(err).context("failed to accept connection")
            }
        }
    }

    fn spawn_session(&self, socket: TcpStream, peer: SocketAddr) {
        let ctx = SessionContext {
            id: self.next_id(),
            peer,
            idle_timeout: self.idle_timeout,
        };
        let store = self.store.clone();
        let guard = ActiveSession::enter(Arc::clone(&self.stats));
        let span = info_span!("session", conn_id = ctx.id, peer = %peer);

        tokio::spawn(
            async move {
                let _guard = guard;
                info!("accepted connection");
                match handle_connection(socket, store, ctx).await {
                    Ok(()) => {}
                    Err(err @ SessionError::Idle(_)) => info!(error = %err, "closing idle session"),
                    Err(err) => warn!(error = %err, "session closed with error"),
                }
            }
            .instrument(span),
        );
    }
}

/// Whether an accept failure concerns only the connection being accepted
/// (or a temporary resource shortage) rather than the listener itself.
pub fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    matches!(
        err.kind(),
        ConnectionAborted
            | ConnectionReset
            | ConnectionRefused
            | Interrupted
            | WouldBlock
            | TimedOut
            | PermissionDenied
            | OutOfMemory
    ) || matches!(err.raw_os_error(), Some(23 | 24)) // ENFILE, EMFILE
}

#[derive(Debug, Default)]
pub struct SessionStats {
    active: AtomicU64,
    total: AtomicU64,
}

impl SessionStats {
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Counts a session as active for as long as it is alive, panics included.
struct ActiveSession(Arc<SessionStats>);

impl ActiveSession {
    fn enter(stats: Arc<SessionStats>) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        stats.total.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

fn spawn_stats_reporter(
    stats: Arc<SessionStats>,
    store: KeyValueStore,
    interval: Duration,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let keys = store.len().await;
            debug!(
                active = stats.active(),
                total = stats.total(),
                keys,
                "session stats"
            );
        }
    }))
}
