//! TCP server lifecycle.
//!
//! Binds the listening socket, starts the background index loader and the
//! accept loop, and on interrupt drains in an orderly way:
//!
//! ```text
//! Init -> Binding -> Accepting -> Draining -> Stopped
//! ```
//!
//! Draining stops admitting connections but lets open ones run to
//! completion, for up to the configured drain timeout. The server stops only
//! after the accept loop has returned and the loader thread has been joined.

use crate::config::Config;
use crate::connection::handle_connection;
use crate::error::{BindError, ServerError};
use crate::loader::{DeferredLoader, IndexHandle, LoadOutcome};
use crate::registry::ActiveConnections;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Listen backlog for the server socket
const LISTEN_BACKLOG: i32 = 1024;

/// Server lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Binding,
    Accepting,
    Draining,
    Stopped,
}

/// Idempotent shutdown trigger shared by the signal watcher and the server.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Shutdown { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns `true` only for the first request; later
    /// requests have no effect.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        })
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        stopped(&mut self.subscribe()).await;
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    // A closed channel also means stop
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Summary of a completed run
#[derive(Debug)]
pub struct ShutdownReport {
    pub load: LoadOutcome,
    /// Connections still open when the drain timeout elapsed
    pub abandoned_connections: usize,
}

/// A bound server, ready to run
pub struct Server {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
    index: IndexHandle,
    connections: Arc<ActiveConnections>,
}

impl Server {
    /// Resolve the configured address and bind the listening socket.
    ///
    /// Nothing is started if binding fails.
    pub async fn bind(config: Config) -> Result<Self, BindError> {
        debug!(phase = ?Phase::Init, address = %config.listen_addr(), "Resolving address");
        info!(phase = ?Phase::Binding, address = %config.listen_addr(), "Binding");

        let listener = bind_listener(&config.host, config.port).await?;
        let local_addr = listener.local_addr().map_err(|source| BindError {
            addr: config.listen_addr(),
            source,
        })?;

        Ok(Server {
            config,
            listener,
            local_addr,
            index: IndexHandle::new(),
            connections: ActiveConnections::new(),
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to the index, for testing
    #[cfg(test)]
    pub fn index(&self) -> IndexHandle {
        self.index.clone()
    }

    /// Live connection registry, for testing
    #[cfg(test)]
    pub fn connections(&self) -> Arc<ActiveConnections> {
        Arc::clone(&self.connections)
    }

    /// Serve until `shutdown` is triggered, then drain.
    pub async fn run(self, shutdown: Shutdown) -> Result<ShutdownReport, ServerError> {
        let Server {
            config,
            listener,
            local_addr,
            index,
            connections,
        } = self;

        let loader = DeferredLoader::start(
            index.clone(),
            config.index_source.clone(),
            config.warmup,
            |elapsed| {
                info!(elapsed_ms = elapsed.as_millis() as u64, "Index ready");
            },
        )?;

        let acceptor = tokio::spawn(accept_loop(
            listener,
            index.clone(),
            Arc::clone(&connections),
            config.max_connections,
            shutdown.subscribe(),
        ));

        info!(
            phase = ?Phase::Accepting,
            address = %local_addr,
            max_connections = config.max_connections,
            "Server listening"
        );

        shutdown.wait().await;
        info!(
            phase = ?Phase::Draining,
            active = connections.len(),
            "Shutdown requested, no longer accepting connections"
        );

        let listener = acceptor
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        if !index.is_ready() && !index.is_failed() {
            info!("Waiting for index loader to finish");
        }
        let load = loader.join(&index).await;
        debug!(outcome = ?load, "Index loader joined");

        drop(listener);
        debug!(address = %local_addr, "Listening socket released");

        let drained = connections
            .wait_empty_timeout(config.drain_timeout)
            .await;
        let abandoned_connections = if drained { 0 } else { connections.len() };
        if abandoned_connections > 0 {
            warn!(
                remaining = abandoned_connections,
                "Drain timeout elapsed, abandoning open connections"
            );
        }

        info!(phase = ?Phase::Stopped, "Shutdown complete");
        Ok(ShutdownReport {
            load,
            abandoned_connections,
        })
    }
}

/// Resolve `host:port` and create a non-blocking listening socket.
pub async fn bind_listener(host: &str, port: u16) -> Result<TcpListener, BindError> {
    let requested = format!("{host}:{port}");

    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| BindError {
            addr: requested.clone(),
            source,
        })?
        .next()
        .ok_or_else(|| BindError {
            addr: requested.clone(),
            source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved"),
        })?;

    let listener = create_listener(addr)
        .and_then(TcpListener::from_std)
        .map_err(|source| BindError {
            addr: requested,
            source,
        })?;
    Ok(listener)
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // No SO_REUSEPORT: a second server on the same address must fail
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Accept connections until shutdown, spawning a handler for each.
///
/// Returns the listener so the caller decides when the socket is released.
async fn accept_loop(
    listener: TcpListener,
    index: IndexHandle,
    connections: Arc<ActiveConnections>,
    max_connections: usize,
    mut shutdown: watch::Receiver<bool>,
) -> TcpListener {
    let connection_limit = Arc::new(Semaphore::new(max_connections));

    loop {
        // Wait for a connection slot
        let permit = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            permit = Arc::clone(&connection_limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        debug!(peer = %peer, "New connection");
        let slot = connections.register(peer);
        let index = index.clone();

        tokio::spawn(async move {
            handle_connection(stream, peer, index, slot).await;
            drop(permit);
        });
    }

    debug!("Accept loop stopped");
    listener
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Turn every interrupt into a shutdown request. Repeats are ignored.
pub async fn watch_signals(shutdown: Shutdown) {
    loop {
        shutdown_signal().await;
        if shutdown.trigger() {
            info!("Interrupt received, waiting for loader and connections to finish");
        } else {
            warn!("Already shutting down, ignoring repeated interrupt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexSource;
    use crate::loader::{STATUS_LOADING, STATUS_UNAVAILABLE};
    use crate::protocol::PROMPT;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        Config {
            port: 0,
            index_source: IndexSource::UnicodeData(
                Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/UnicodeData.txt"),
            ),
            ..Config::default()
        }
    }

    struct Running {
        addr: SocketAddr,
        index: IndexHandle,
        connections: Arc<ActiveConnections>,
        shutdown: Shutdown,
        task: JoinHandle<Result<ShutdownReport, ServerError>>,
    }

    async fn start(config: Config) -> Running {
        let server = Server::bind(config).await.unwrap();
        let shutdown = Shutdown::new();
        Running {
            addr: server.local_addr(),
            index: server.index(),
            connections: server.connections(),
            shutdown: shutdown.clone(),
            task: tokio::spawn(server.run(shutdown)),
        }
    }

    async fn wait_ready(index: &IndexHandle) {
        timeout(WAIT, async {
            while !index.is_ready() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("index never became ready");
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            let mut client = Client {
                reader: BufReader::new(reader),
                writer,
            };
            client.expect_prompt().await;
            client
        }

        async fn expect_prompt(&mut self) {
            let mut buf = [0u8; 3];
            self.reader.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf[..], PROMPT);
        }

        async fn send(&mut self, data: &[u8]) {
            self.writer.write_all(data).await.unwrap();
        }

        /// Send a query and collect result lines and the status line.
        async fn query(&mut self, query: &str) -> (Vec<String>, String) {
            self.send(format!("{query}\r\n").as_bytes()).await;

            let mut lines = Vec::new();
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).await.unwrap();
                let line = line.trim_end_matches("\r\n").to_string();
                if line.starts_with("U+") {
                    lines.push(line);
                } else {
                    self.expect_prompt().await;
                    return (lines, line);
                }
            }
        }

        async fn read_to_end(mut self) -> Vec<u8> {
            let mut rest = Vec::new();
            self.reader.read_to_end(&mut rest).await.unwrap();
            rest
        }
    }

    #[tokio::test]
    async fn test_query_after_ready() {
        let server = start(test_config()).await;
        wait_ready(&server.index).await;

        let mut client = Client::connect(server.addr).await;
        let (lines, status) = client.query("cat").await;
        assert!(!lines.is_empty());
        assert!(lines.iter().all(|line| line.contains("CAT")));
        assert_eq!(status, format!("{} matches for 'cat'", lines.len()));

        // Same query, same answer
        let (again, again_status) = client.query("cat").await;
        assert_eq!(lines, again);
        assert_eq!(status, again_status);

        let (lines, status) = client.query("chess king").await;
        assert_eq!(lines.len(), 2);
        assert_eq!(status, "2 matches for 'chess king'");

        client.send(b"\x01\r\n").await;
        assert!(client.read_to_end().await.is_empty());

        server.shutdown.trigger();
        timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_query_before_ready_reports_loading() {
        let server = start(Config {
            warmup: Duration::from_millis(500),
            ..test_config()
        })
        .await;

        let mut client = Client::connect(server.addr).await;
        let (lines, status) = client.query("cat").await;
        assert!(lines.is_empty());
        assert_eq!(status, STATUS_LOADING);

        wait_ready(&server.index).await;
        let (lines, _) = client.query("cat").await;
        assert!(!lines.is_empty());

        client.send(b"\x01\r\n").await;
        server.shutdown.trigger();
        timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_line_keeps_connection_open() {
        let server = start(test_config()).await;

        let mut client = Client::connect(server.addr).await;
        client.send(b"\r\n").await;
        client.expect_prompt().await;
        assert_eq!(server.connections.len(), 1);

        client.send(b"\x01\r\n").await;
        assert!(client.read_to_end().await.is_empty());

        server.shutdown.trigger();
        timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_others() {
        let server = start(test_config()).await;
        wait_ready(&server.index).await;

        // A holds a half-written line
        let mut slow = Client::connect(server.addr).await;
        slow.send(b"ch").await;

        let mut fast = Client::connect(server.addr).await;
        let (lines, status) = timeout(Duration::from_secs(2), fast.query("cat face"))
            .await
            .expect("fast client was delayed");
        assert!(!lines.is_empty());
        assert!(status.ends_with("for 'cat face'"));
        fast.send(b"\x01\r\n").await;

        slow.send(b"ess\r\n").await;
        let mut line = String::new();
        slow.reader.read_line(&mut line).await.unwrap();
        assert!(line.contains("CHESS"));
        drop(slow);

        server.shutdown.trigger();
        timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_load_keeps_serving() {
        let server = start(Config {
            index_source: IndexSource::UnicodeData(PathBuf::from("/nonexistent/UnicodeData.txt")),
            ..test_config()
        })
        .await;

        timeout(WAIT, async {
            while !server.index.is_failed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let mut client = Client::connect(server.addr).await;
        let (lines, status) = client.query("cat").await;
        assert!(lines.is_empty());
        assert_eq!(status, STATUS_UNAVAILABLE);
        client.send(b"\x01\r\n").await;

        server.shutdown.trigger();
        let report = timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
        assert!(matches!(report.load, LoadOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_joins_loader() {
        let server = start(Config {
            warmup: Duration::from_millis(300),
            ..test_config()
        })
        .await;

        assert!(server.shutdown.trigger());
        assert!(!server.shutdown.trigger());

        let report = timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
        // The run only ends once the loader thread has finished
        assert!(matches!(report.load, LoadOutcome::Ready { .. }));
        assert!(server.index.is_ready());
        assert_eq!(report.abandoned_connections, 0);

        assert!(!server.shutdown.trigger());
        assert!(TcpStream::connect(server.addr).await.is_err());
    }

    #[tokio::test]
    async fn test_open_connection_survives_drain() {
        let server = start(test_config()).await;
        wait_ready(&server.index).await;

        let mut client = Client::connect(server.addr).await;
        server.shutdown.trigger();
        server.shutdown.trigger();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.task.is_finished());
        assert!(TcpStream::connect(server.addr).await.is_err());

        let (lines, _) = client.query("cat").await;
        assert!(!lines.is_empty());

        client.send(b"\x01\r\n").await;
        assert!(client.read_to_end().await.is_empty());

        let report = timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
        assert_eq!(report.abandoned_connections, 0);
        assert!(server.connections.is_empty());
    }

    #[tokio::test]
    async fn test_drain_timeout_abandons_idle_connections() {
        let server = start(Config {
            drain_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        })
        .await;

        let _idle = Client::connect(server.addr).await;
        server.shutdown.trigger();

        let report = timeout(WAIT, server.task).await.unwrap().unwrap().unwrap();
        assert_eq!(report.abandoned_connections, 1);
    }

    #[tokio::test]
    async fn test_idle_client_does_not_block_stop() {
        let config = test_config();
        let grace = config.drain_timeout.expect("default drain is bounded");
        let server = start(config).await;
        wait_ready(&server.index).await;

        let _idle = Client::connect(server.addr).await;
        assert!(server.shutdown.trigger());
        assert!(!server.shutdown.trigger());

        let report = timeout(grace + WAIT, server.task)
            .await
            .expect("server never stopped")
            .unwrap()
            .unwrap();
        assert!(matches!(report.load, LoadOutcome::Ready { .. }));
        assert_eq!(report.abandoned_connections, 1);
    }

    #[tokio::test]
    async fn test_bind_address_in_use() {
        let first = Server::bind(test_config()).await.unwrap();
        let port = first.local_addr().port();

        let err = Server::bind(Config {
            port,
            ..test_config()
        })
        .await
        .err()
        .expect("second bind should fail");
        assert_eq!(err.addr, format!("127.0.0.1:{port}"));
        assert_eq!(err.source.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_shutdown_without_receivers() {
        let shutdown = Shutdown::new();
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(!shutdown.clone().trigger());
    }
}
