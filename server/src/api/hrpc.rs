//! Binary RPC endpoint
//!
//! Length-prefixed frames over TCP for clients that prefer the packed span
//! form to JSON. Request frames are `[u32 method][u32 body_len][body]`,
//! responses are `[u32 status][u32 body_len][body]`; all integers big-endian.
//! Status 0 is success; anything else carries the error text as the body.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::data::DataStore;
use crate::data::store::query::Query as SpanQuery;
use crate::data::types::{Span, WriteSpansRequest};
use crate::domain::SpanIngestor;

pub const METHOD_WRITE_SPANS: u32 = 1;
pub const METHOD_QUERY: u32 = 2;

const STATUS_OK: u32 = 0;
const STATUS_ERROR: u32 = 1;

/// Cap on a single request frame.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

pub struct HrpcServer {
    pub local_addr: SocketAddr,
    pub task: JoinHandle<()>,
}

impl HrpcServer {
    /// Bind the listener and start the accept loop.
    pub async fn start(
        addr: SocketAddr,
        store: Arc<DataStore>,
        query_timeout: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<HrpcServer> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "HRPC server listening");

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((socket, peer)) => {
                                let store = Arc::clone(&store);
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        serve_connection(socket, peer, store, query_timeout).await
                                    {
                                        tracing::debug!(peer = %peer, error = %e, "HRPC connection closed");
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "HRPC accept failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("HRPC server shutdown complete");
        });

        Ok(HrpcServer { local_addr, task })
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    store: Arc<DataStore>,
    query_timeout: Duration,
) -> std::io::Result<()> {
    loop {
        let method = match socket.read_u32().await {
            Ok(method) => method,
            // Clean end of stream between frames.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let body_len = socket.read_u32().await?;
        if body_len > MAX_FRAME_BYTES {
            write_frame(
                &mut socket,
                STATUS_ERROR,
                format!("Frame of {} bytes exceeds the limit", body_len).as_bytes(),
            )
            .await?;
            return Ok(());
        }
        let mut body = vec![0u8; body_len as usize];
        socket.read_exact(&mut body).await?;

        let reply = match method {
            METHOD_WRITE_SPANS => handle_write_spans(&store, &peer, &body).await,
            METHOD_QUERY => handle_query(&store, query_timeout, &body).await,
            other => Err(format!("Unknown method {}", other)),
        };
        match reply {
            Ok(body) => write_frame(&mut socket, STATUS_OK, &body).await?,
            Err(message) => {
                tracing::debug!(peer = %peer, error = %message, "HRPC request failed");
                write_frame(&mut socket, STATUS_ERROR, message.as_bytes()).await?;
            }
        }
    }
}

async fn write_frame(socket: &mut TcpStream, status: u32, body: &[u8]) -> std::io::Result<()> {
    socket.write_u32(status).await?;
    socket.write_u32(body.len() as u32).await?;
    socket.write_all(body).await?;
    socket.flush().await
}

/// Packed writeSpans: the client asked for reliability, so wait for queue
/// room instead of dropping on backpressure.
async fn handle_write_spans(
    store: &Arc<DataStore>,
    peer: &SocketAddr,
    body: &[u8],
) -> Result<Vec<u8>, String> {
    let request =
        WriteSpansRequest::decode(body).map_err(|e| format!("Error parsing spans: {}", e))?;
    let mut ingestor = SpanIngestor::new(store, &peer.ip().to_string(), &request.default_tracer_id);
    for record in request.spans {
        let span = match Span::try_from(record) {
            Ok(span) => span,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "Dropping bad span");
                continue;
            }
        };
        if let Err(e) = ingestor.ingest_wait(span).await {
            if !e.is_bad_request() {
                ingestor.close(Utc::now()).await;
                return Err(e.to_string());
            }
            tracing::debug!(peer = %peer, error = %e, "Dropping bad span");
        }
    }
    ingestor.close(Utc::now()).await;
    Ok(Vec::new())
}

async fn handle_query(
    store: &Arc<DataStore>,
    query_timeout: Duration,
    body: &[u8],
) -> Result<Vec<u8>, String> {
    let query: SpanQuery =
        serde_json::from_slice(body).map_err(|e| format!("Error parsing query: {}", e))?;
    let (spans, _scanned) = store
        .handle_query(&query, Some(query_timeout))
        .await
        .map_err(|e| e.to_string())?;
    serde_json::to_vec(&spans).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::data::DataStoreConfig;
    use crate::data::store::writer::ShardWriterConfig;
    use crate::data::types::SpanRecord;
    use crate::domain::metrics::{MetricsSink, MetricsSinkConfig};

    async fn test_store(dir: &tempfile::TempDir) -> Arc<DataStore> {
        let msink = Arc::new(MetricsSink::new(MetricsSinkConfig {
            max_addr_entries: 16,
            heartbeat_period: Duration::from_secs(30),
        }));
        Arc::new(
            DataStore::open(
                DataStoreConfig {
                    directories: vec![dir.path().join("shard0"), dir.path().join("shard1")],
                    clear: false,
                    writer: ShardWriterConfig::default(),
                    heartbeat_period: Duration::from_secs(30),
                },
                msink,
            )
            .await
            .unwrap(),
        )
    }

    async fn call(
        socket: &mut TcpStream,
        method: u32,
        body: &[u8],
    ) -> (u32, Vec<u8>) {
        socket.write_u32(method).await.unwrap();
        socket.write_u32(body.len() as u32).await.unwrap();
        socket.write_all(body).await.unwrap();
        let status = socket.read_u32().await.unwrap();
        let len = socket.read_u32().await.unwrap();
        let mut reply = vec![0u8; len as usize];
        socket.read_exact(&mut reply).await.unwrap();
        (status, reply)
    }

    #[tokio::test]
    async fn test_packed_write_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = HrpcServer::start(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&store),
            Duration::from_secs(30),
            shutdown_rx,
        )
        .await
        .unwrap();

        let mut socket = TcpStream::connect(server.local_addr).await.unwrap();

        let request = WriteSpansRequest {
            default_tracer_id: "packedd".to_string(),
            spans: vec![SpanRecord {
                id: {
                    let mut id = vec![0u8; 16];
                    id[15] = 7;
                    id
                },
                begin: 10,
                end: 20,
                description: "packedSpan".to_string(),
                ..Default::default()
            }],
        };
        let (status, _) = call(&mut socket, METHOD_WRITE_SPANS, &request.encode_to_vec()).await;
        assert_eq!(status, STATUS_OK);
        store.flush().await.unwrap();

        let query = r#"{"pred":[{"op":"ge","field":"begin","val":"0"}],"lim":10}"#;
        let (status, reply) = call(&mut socket, METHOD_QUERY, query.as_bytes()).await;
        assert_eq!(status, STATUS_OK);
        let spans: Vec<Span> = serde_json::from_slice(&reply).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].description, "packedSpan");
        assert_eq!(spans[0].tracer_id, "packedd");

        // Unknown methods and bad bodies surface as error frames, not drops.
        let (status, reply) = call(&mut socket, 99, b"").await;
        assert_eq!(status, STATUS_ERROR);
        assert!(String::from_utf8(reply).unwrap().contains("Unknown method"));

        let (status, _) = call(&mut socket, METHOD_QUERY, b"not json").await;
        assert_eq!(status, STATUS_ERROR);

        drop(socket);
        let _ = shutdown_tx.send(true);
        let _ = server.task.await;
        store.shutdown().await;
    }
}
