//! Duplex stream to the Results Collector.

use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::wire::{CodecError, Hello, StreamCodec, StreamMessage};
use crate::config::CollectorConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: CodecError,
    },

    #[error("result stream is closed")]
    Closed,

    #[error("result stream fell behind by {0} frames")]
    Backlogged(usize),
}

/// Outbound half of the result stream.
///
/// `send` never waits on the network. A failed write surfaces as
/// [`TransportError::Closed`] on a later `send`.
#[async_trait]
pub trait Transport: Send {
    fn send(&mut self, message: StreamMessage) -> Result<(), TransportError>;

    /// Flush what was queued and close the connection.
    async fn close(&mut self);
}

/// Opens a [`Transport`] for one run.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, hello: Hello) -> Result<Box<dyn Transport>, TransportError>;
}

/// Limits that keep a slow or silent collector from holding up a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Covers the TCP connect and the `hello` write.
    pub connect_timeout: Duration,
    /// How long `close` waits for the writer before abandoning it.
    pub close_timeout: Duration,
    /// Frames queued ahead of the writer.
    pub queue_depth: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&CollectorConfig::default())
    }
}

impl From<&CollectorConfig> for StreamOptions {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.stream_connect_timeout_ms),
            close_timeout: Duration::from_millis(config.stream_close_timeout_ms),
            queue_depth: config.stream_queue_depth.max(1),
        }
    }
}

/// TCP connector for the collector's stream endpoint.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    options: StreamOptions,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            options: StreamOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, hello: Hello) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(FramedTransport::connect(&self.addr, hello, self.options).await?))
    }
}

/// Framed TCP stream with a background writer task.
pub struct FramedTransport {
    tx: Option<mpsc::Sender<StreamMessage>>,
    writer: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl FramedTransport {
    /// Connect to `addr` and send the `hello` frame before returning.
    pub async fn connect(
        addr: &str,
        hello: Hello,
        options: StreamOptions,
    ) -> Result<Self, TransportError> {
        info!(address = %addr, run_id = %hello.run_id, "connecting to result stream");
        let handshake = async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| TransportError::Connect {
                    addr: addr.to_string(),
                    source,
                })?;
            let mut framed = Framed::new(stream, StreamCodec::new());
            framed
                .send(StreamMessage::Hello(hello))
                .await
                .map_err(|source| TransportError::Handshake {
                    addr: addr.to_string(),
                    source,
                })?;
            Ok::<_, TransportError>(framed)
        };
        let mut framed = tokio::time::timeout(options.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::Connect {
                addr: addr.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no connection within {:?}", options.connect_timeout),
                ),
            })??;

        let (tx, mut rx) = mpsc::channel::<StreamMessage>(options.queue_depth);
        let peer = addr.to_string();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let kind = message.kind();
                if let Err(e) = framed.send(message).await {
                    warn!(address = %peer, message = kind, error = %e, "result stream write failed");
                    return;
                }
            }
            if let Err(e) = framed.close().await {
                debug!(address = %peer, error = %e, "result stream close failed");
            }
        });

        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
            close_timeout: options.close_timeout,
        })
    }
}

#[async_trait]
impl Transport for FramedTransport {
    fn send(&mut self, message: StreamMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                // The peer stopped reading. Stop queueing for it.
                let depth = tx.max_capacity();
                self.tx = None;
                Err(TransportError::Backlogged(depth))
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        // Dropping the sender lets the writer drain and exit.
        self.tx.take();
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        match tokio::time::timeout(self.close_timeout, &mut writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "result stream writer ended abnormally"),
            Err(_) => {
                writer.abort();
                warn!(
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    "result stream did not drain in time, dropping unsent frames"
                );
            }
        }
    }
}

impl Drop for FramedTransport {
    fn drop(&mut self) {
        // Abandoned without `close`: nothing will wait for the writer.
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::reporter::wire::{ErrorDetail, RunEnd, RunError, RunStatus};

    fn hello() -> Hello {
        Hello {
            run_id: "run-1".to_string(),
            tenant_id: "tenant-a".to_string(),
            worker_id: "worker-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_hello_then_messages_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, StreamCodec::new());
            let mut kinds = Vec::new();
            while let Some(msg) = framed.next().await {
                kinds.push(msg.unwrap().kind());
            }
            kinds
        });

        let mut transport = FramedTransport::connect(&addr, hello(), StreamOptions::default())
            .await
            .unwrap();
        transport
            .send(StreamMessage::RunEnd(RunEnd {
                run_id: "run-1".to_string(),
                status: RunStatus::Completed,
                total_tests: 0,
                passed_tests: 0,
                failed_tests: 0,
                skipped_tests: 0,
                timestamp: chrono::Utc::now(),
            }))
            .unwrap();
        transport.close().await;

        assert_eq!(server.await.unwrap(), vec!["hello", "run:end"]);
        assert!(matches!(
            transport.send(StreamMessage::Hello(hello())),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let err = TcpConnector::new(addr).connect(hello()).await.err().unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
    }

    fn bulky_error(i: usize) -> StreamMessage {
        StreamMessage::RunError(RunError {
            run_id: "run-1".to_string(),
            error: ErrorDetail {
                message: format!("failure {i}"),
                stack: Some("x".repeat(64 * 1024)),
            },
            timestamp: chrono::Utc::now(),
        })
    }

    /// Accepts one connection and holds it open without reading.
    async fn silent_peer() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let peer = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        (addr, peer)
    }

    #[tokio::test]
    async fn test_close_gives_up_on_a_peer_that_stops_reading() {
        let (addr, peer) = silent_peer().await;
        let options = StreamOptions {
            close_timeout: Duration::from_millis(200),
            ..StreamOptions::default()
        };
        let mut transport = FramedTransport::connect(&addr, hello(), options).await.unwrap();
        for i in 0..300 {
            if transport.send(bulky_error(i)).is_err() {
                break;
            }
        }

        let closed = tokio::time::timeout(Duration::from_secs(5), transport.close()).await;
        assert!(closed.is_ok(), "close waited on a stalled peer");
        assert!(transport.send(bulky_error(0)).is_err());
        peer.abort();
    }

    #[tokio::test]
    async fn test_full_queue_drops_the_stream() {
        let (addr, peer) = silent_peer().await;
        let options = StreamOptions {
            close_timeout: Duration::from_millis(100),
            queue_depth: 4,
            ..StreamOptions::default()
        };
        let mut transport = FramedTransport::connect(&addr, hello(), options).await.unwrap();

        let mut outcome = Ok(());
        for i in 0..500 {
            outcome = transport.send(bulky_error(i));
            if outcome.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(outcome, Err(TransportError::Backlogged(4))));
        assert!(matches!(transport.send(bulky_error(0)), Err(TransportError::Closed)));

        transport.close().await;
        peer.abort();
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        // Non-routable address: the SYN goes nowhere or is rejected outright.
        let connector = TcpConnector::new("10.255.255.1:9").with_options(StreamOptions {
            connect_timeout: Duration::from_millis(100),
            ..StreamOptions::default()
        });
        let started = std::time::Instant::now();
        let err = connector.connect(hello()).await.err().unwrap();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
