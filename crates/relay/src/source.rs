//! The Source Client: pulls an RTCM stream from one upstream
//! caster/mountpoint, drives its own reconnect state machine, and
//! reports frames and liveness to whoever constructed it via the
//! [`SourceObserver`] trait — an actor with a polymorphic observer
//! rather than a plain event emitter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::Mutex;
use proto::http::{basic_auth_header, classify_status_line, first_line, HeaderAccumulator, StatusOutcome};
use proto::nmea::{Gga, UtcTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::CoreError;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_ATTEMPTS: u32 = 10;

/// Upstream connection parameters for one station.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub mountpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// The reconnect state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Dialing,
    Handshaking,
    Streaming,
    Closing,
    Backoff,
}

/// Observer hooks a `SourceClient` calls back into. Implemented by the
/// Relay Supervisor's per-session wiring.
#[async_trait::async_trait]
pub trait SourceObserver: Send + Sync {
    async fn on_frame(&self, bytes: &[u8]);
    async fn on_connected(&self);
    async fn on_disconnected(&self);
    async fn on_error(&self, err: &CoreError);
}

/// Point-in-time counters exposed by `stats()`.
#[derive(Debug, Clone, Copy)]
pub struct SourceStats {
    pub connected: bool,
    pub last_data_at: Option<SystemTime>,
    pub bytes_received: u64,
}

/// One running upstream pull session. Cheap to clone (an `Arc` wrapper
/// around the shared state); `connect`/`disconnect` drive a background
/// task that owns the socket.
#[derive(Clone)]
pub struct SourceClient {
    inner: Arc<Inner>,
}

struct Inner {
    target: UpstreamTarget,
    observer: Arc<dyn SourceObserver>,
    connected: AtomicBool,
    last_data_at: AtomicU64,
    bytes_received: AtomicU64,
    stop: Notify,
    stopped: AtomicBool,
    active_socket: Mutex<Option<Arc<TcpStream>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SourceClient {
    pub fn new(target: UpstreamTarget, observer: Arc<dyn SourceObserver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                target,
                observer,
                connected: AtomicBool::new(false),
                last_data_at: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                stop: Notify::new(),
                stopped: AtomicBool::new(false),
                active_socket: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Send a single NMEA GGA sentence on the current connection, if
    /// any. Returns whether it was written. Best-effort: a write failure is reported via
    /// `onError` but does not itself disconnect.
    pub async fn send_position(&self, lat: f64, lon: f64, altitude_m: f64) -> bool {
        let socket = self.inner.active_socket.lock().clone();
        let Some(socket) = socket else { return false };
        let sentence = position_sentence(lat, lon, altitude_m);
        match socket.writable().await {
            Ok(()) => match socket.try_write(sentence.as_bytes()) {
                Ok(n) if n == sentence.len() => true,
                Ok(_) => false,
                Err(e) => {
                    self.inner.observer.on_error(&CoreError::TransportError(e)).await;
                    false
                }
            },
            Err(e) => {
                self.inner.observer.on_error(&CoreError::TransportError(e)).await;
                false
            }
        }
    }

    /// Begin the connect/reconnect loop as a background task. Idempotent:
    /// calling twice on an already-running client is a no-op from the
    /// caller's point of view (the loop task itself owns the state
    /// machine).
    pub fn connect(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_state_machine(inner).await;
        });
        *self.inner.task.lock() = Some(handle);
    }

    /// Tear down the socket and cancel any pending reconnect. Synchronous
    /// relative to the session's callbacks: awaits the background loop's
    /// `JoinHandle` before returning, so no `on_frame` already in flight
    /// can complete after this call does.
    pub async fn disconnect(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.stop.notify_waiters();

        let handle = self.inner.task.lock().take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
    }

    pub fn stats(&self) -> SourceStats {
        let raw = self.inner.last_data_at.load(Ordering::SeqCst);
        SourceStats {
            connected: self.inner.connected.load(Ordering::SeqCst),
            last_data_at: if raw == 0 { None } else { Some(UNIX_EPOCH + Duration::from_millis(raw)) },
            bytes_received: self.inner.bytes_received.load(Ordering::SeqCst),
        }
    }

    /// Whether data has flowed within the liveness window, independent of
    /// whether the TCP socket itself is still up.
    pub fn is_data_live(&self, window: Duration) -> bool {
        let stats = self.stats();
        match stats.last_data_at {
            Some(t) => stats.connected && SystemTime::now().duration_since(t).unwrap_or(Duration::MAX) < window,
            None => false,
        }
    }
}

async fn run_state_machine(inner: Arc<Inner>) {
    let mut attempts: u32 = 0;
    let mut state = SourceState::Idle;

    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            state = SourceState::Closing;
        }

        state = match state {
            SourceState::Idle | SourceState::Dialing => {
                match dial_and_handshake(&inner).await {
                    Ok(stream) => {
                        let stream = Arc::new(stream);
                        attempts = 0;
                        *inner.active_socket.lock() = Some(stream.clone());
                        inner.connected.store(true, Ordering::SeqCst);
                        inner.observer.on_connected().await;
                        let result = stream_loop(&inner, &stream).await;
                        *inner.active_socket.lock() = None;
                        inner.connected.store(false, Ordering::SeqCst);
                        inner.observer.on_disconnected().await;
                        match result {
                            Ok(()) => SourceState::Backoff,
                            Err(e) => {
                                inner.observer.on_error(&e).await;
                                SourceState::Backoff
                            }
                        }
                    }
                    Err(CoreError::AuthRejected) => {
                        inner.observer.on_error(&CoreError::AuthRejected).await;
                        SourceState::Closing
                    }
                    Err(e) => {
                        inner.observer.on_error(&e).await;
                        SourceState::Backoff
                    }
                }
            }
            SourceState::Backoff => {
                attempts += 1;
                if attempts >= MAX_ATTEMPTS {
                    warn!("source client for {} exhausted reconnect budget", inner.target.mountpoint);
                    inner.observer.on_error(&CoreError::TransportError(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "reconnect attempts exhausted",
                    ))).await;
                    SourceState::Closing
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_INTERVAL) => SourceState::Dialing,
                        _ = inner.stop.notified() => SourceState::Closing,
                    }
                }
            }
            SourceState::Handshaking | SourceState::Streaming => unreachable!("folded into Dialing above"),
            SourceState::Closing => {
                inner.connected.store(false, Ordering::SeqCst);
                return;
            }
        };
    }
}

async fn dial_and_handshake(inner: &Inner) -> Result<TcpStream, CoreError> {
    let target = &inner.target;
    debug!("dialing upstream {}:{} mountpoint {}", target.host, target.port, target.mountpoint);

    let stream = timeout(READ_TIMEOUT, TcpStream::connect((target.host.as_str(), target.port)))
        .await
        .map_err(|_| CoreError::Timeout)??;
    stream.set_nodelay(true).ok();

    let mut request = format!(
        "GET /{mp} HTTP/1.1\r\nHost: {host}:{port}\r\nUser-Agent: NTRIP-Relay/1.0\r\n",
        mp = target.mountpoint,
        host = target.host,
        port = target.port,
    );
    if let (Some(user), Some(pass)) = (&target.username, &target.password) {
        request.push_str(&basic_auth_header(user, pass));
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    let mut stream = stream;
    timeout(READ_TIMEOUT, stream.write_all(request.as_bytes())).await.map_err(|_| CoreError::Timeout)??;

    let mut accumulator = HeaderAccumulator::new();
    let mut buf = [0u8; 4096];
    let residual = loop {
        let n = timeout(READ_TIMEOUT, stream.read(&mut buf)).await.map_err(|_| CoreError::Timeout)??;
        if n == 0 {
            return Err(CoreError::TransportError(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "upstream closed during handshake")));
        }
        match accumulator.feed(&buf[..n]).map_err(|e| CoreError::ProtocolError(e.to_string()))? {
            Some(header_len) => {
                let full = accumulator.buf();
                let status_line = first_line(full).ok_or_else(|| CoreError::ProtocolError("empty status line".to_string()))?;
                match classify_status_line(status_line) {
                    StatusOutcome::IcyOk => {}
                    StatusOutcome::Unauthorized => return Err(CoreError::AuthRejected),
                    StatusOutcome::Other => return Err(CoreError::ProtocolError(status_line.to_string())),
                }
                break full[header_len..].to_vec();
            }
            None => continue,
        }
    };

    if !residual.is_empty() {
        inner.bytes_received.fetch_add(residual.len() as u64, Ordering::SeqCst);
        mark_data(inner);
        inner.observer.on_frame(&residual).await;
    }

    Ok(stream)
}

async fn stream_loop(inner: &Inner, stream: &Arc<TcpStream>) -> Result<(), CoreError> {
    let mut buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            _ = inner.stop.notified() => return Ok(()),
            readable = stream.readable() => {
                readable?;
                match stream.try_read(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(n) => {
                        inner.bytes_received.fetch_add(n as u64, Ordering::SeqCst);
                        mark_data(inner);
                        inner.observer.on_frame(&buf[..n]).await;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

fn mark_data(inner: &Inner) {
    let now_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as u64;
    inner.last_data_at.store(now_ms, Ordering::SeqCst);
}

/// Build the keep-alive/VRS position GGA sentence sent on connect and
/// every 60 s thereafter.
pub fn position_sentence(lat: f64, lon: f64, altitude_m: f64) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs_f64();
    let gga = Gga::keepalive(UtcTime::from_unix_seconds(now), lat, lon, altitude_m);
    gga.to_sentence()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullObserver;

    #[async_trait::async_trait]
    impl SourceObserver for NullObserver {
        async fn on_frame(&self, _bytes: &[u8]) {}
        async fn on_connected(&self) {}
        async fn on_disconnected(&self) {}
        async fn on_error(&self, _err: &CoreError) {}
    }

    #[test]
    fn position_sentence_has_expected_prefix() {
        let sentence = position_sentence(21.0285, 105.8542, 100.0);
        assert!(sentence.starts_with("$GPGGA,"));
        assert!(sentence.ends_with("\r\n"));
    }

    #[tokio::test]
    async fn disconnect_before_connect_leaves_client_idle() {
        let target = UpstreamTarget {
            host: "127.0.0.1".to_string(),
            port: 1,
            mountpoint: "RTCM3".to_string(),
            username: None,
            password: None,
        };
        let client = SourceClient::new(target, Arc::new(NullObserver));
        assert!(!client.stats().connected);
        client.disconnect().await;
        assert!(!client.stats().connected);
    }
}
