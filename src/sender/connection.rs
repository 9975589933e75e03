use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

const MAX_CONNECTION_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const DIAL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection to the intake failed after {MAX_CONNECTION_ATTEMPTS} attempts")]
    Exhausted,

    #[error("invalid intake host name '{0}'")]
    InvalidServerName(String),
}

trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// A live stream to the intake. The read half lives in a watcher task that
/// detects a server-initiated close; once it trips, the next write fails
/// fast instead of filling socket buffers.
pub struct Connection {
    writer: WriteHalf<Box<dyn RawStream>>,
    closed: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

impl Connection {
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed by server",
            ));
        }
        self.writer.write_all(buf).await?;
        self.writer.flush().await
    }

    /// Full close: shuts the write half down, then aborts the watcher so
    /// its read half is dropped and the socket is released. The watcher
    /// would otherwise stay blocked on its read, holding the fd half-open
    /// until the remote peer closed.
    async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
        self.watcher.abort();
    }
}

/// Hands out live TCP(+TLS) connections to the intake, hiding reconnection
/// and backoff from the sender. `acquire` is serialized through an internal
/// lock so at most one establishment is in flight at a time.
pub struct ConnectionManager {
    address: String,
    server_name: Option<ServerName<'static>>,
    tls: Option<TlsConnector>,
    state: Mutex<RetryState>,
}

struct RetryState {
    retries: u32,
    first_conn: bool,
}

impl ConnectionManager {
    /// `skip_ssl_validation` selects a plain TCP stream; otherwise the
    /// connection is wrapped in TLS verified against the platform roots.
    pub fn new(host: &str, port: u16, skip_ssl_validation: bool) -> Result<Self, ConnectionError> {
        let (server_name, tls) = if skip_ssl_validation {
            (None, None)
        } else {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| ConnectionError::InvalidServerName(host.to_string()))?;

            let mut roots = RootCertStore::empty();
            let result = rustls_native_certs::load_native_certs();
            for error in &result.errors {
                warn!(error = %error, "could not load a platform root certificate");
            }
            roots.add_parsable_certificates(result.certs);

            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            (
                Some(server_name),
                Some(TlsConnector::from(Arc::new(config))),
            )
        };

        Ok(Self {
            address: format!("{host}:{port}"),
            server_name,
            tls,
            state: Mutex::new(RetryState {
                retries: MAX_CONNECTION_ATTEMPTS,
                first_conn: true,
            }),
        })
    }

    /// Blocks until a connection is established or the attempt budget is
    /// exhausted. After a terminal failure the budget is reset to one, so a
    /// degraded agent keeps probing slowly instead of hammering the intake.
    pub async fn acquire(&self) -> Result<Connection, ConnectionError> {
        let mut state = self.state.lock().await;

        while state.retries > 0 {
            if state.first_conn {
                info!(
                    address = %self.address,
                    tls = self.tls.is_some(),
                    "connecting to the intake"
                );
                state.first_conn = false;
            }
            state.retries -= 1;

            let tcp = match timeout(DIAL_TIMEOUT, TcpStream::connect(&self.address)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(error = %e, "intake connection error");
                    self.backoff(state.retries).await;
                    continue;
                }
                Err(_) => {
                    warn!("intake connection timed out");
                    self.backoff(state.retries).await;
                    continue;
                }
            };

            let stream: Box<dyn RawStream> = match (&self.tls, &self.server_name) {
                (Some(connector), Some(name)) => {
                    match connector.connect(name.clone(), tcp).await {
                        Ok(tls) => Box::new(tls),
                        Err(e) => {
                            warn!(error = %e, "intake TLS handshake error");
                            self.backoff(state.retries).await;
                            continue;
                        }
                    }
                }
                _ => Box::new(tcp),
            };

            state.retries = MAX_CONNECTION_ATTEMPTS;

            let (reader, writer) = tokio::io::split(stream);
            let closed = Arc::new(AtomicBool::new(false));
            let watcher = tokio::spawn(watch_server_close(reader, closed.clone()));

            return Ok(Connection {
                writer,
                closed,
                watcher,
            });
        }

        // Degraded: a single probe per acquire from here on.
        state.retries = 1;
        Err(ConnectionError::Exhausted)
    }

    /// Closes a connection on the client side.
    pub async fn release(&self, conn: Connection) {
        conn.shutdown().await;
    }

    async fn backoff(&self, remaining: u32) {
        let exhausted_attempts = MAX_CONNECTION_ATTEMPTS - remaining;
        tokio::time::sleep(BACKOFF_BASE * exhausted_attempts).await;
    }
}

/// Blocks on a 1-byte read until the server closes the stream, then marks
/// the connection closed so the sender's next write asks for a fresh one.
/// Read errors from a locally-closed connection just end the watch.
async fn watch_server_close(mut reader: ReadHalf<Box<dyn RawStream>>, closed: Arc<AtomicBool>) {
    let mut buf = [0u8; 1];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("intake closed the connection");
                closed.store(true, Ordering::Relaxed);
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "intake connection watch ended");
                closed.store(true, Ordering::Relaxed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_acquire_and_write_plain_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            buf.truncate(n);
            buf
        });

        let manager = ConnectionManager::new("127.0.0.1", port, true).unwrap();
        let mut conn = manager.acquire().await.unwrap();
        conn.write_all(b"hello intake\n").await.unwrap();
        manager.release(conn).await;

        assert_eq!(server.await.unwrap(), b"hello intake\n");
    }

    #[tokio::test]
    async fn test_server_close_is_detected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let manager = ConnectionManager::new("127.0.0.1", port, true).unwrap();
        let mut conn = manager.acquire().await.unwrap();
        server.await.unwrap();

        // Give the watcher a moment to observe the close, then the write
        // must fail fast with an expected-close error.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = conn.write_all(b"late\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        manager.release(conn).await;
    }
}
