//! HTTP ingestion endpoint
//!
//! ## Endpoints
//!
//! - `POST /` - one encoded op per request body; answers `success\n` or
//!   `error\n`

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, WireReplayError};
use crate::execution::{ExecutionContext, PlaybackSummary};
use crate::playback::{OpStream, RecordedOp};

/// Body returned for an accepted op
pub const SUCCESS_BODY: &str = "success\n";

/// Body returned for a rejected op
pub const ERROR_BODY: &str = "error\n";

/// Shared state for the ingestion router
#[derive(Clone)]
pub struct IngestState {
    sender: mpsc::Sender<RecordedOp>,
    accepted: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
}

impl IngestState {
    /// State feeding `sender`
    pub fn new(sender: mpsc::Sender<RecordedOp>) -> Self {
        Self {
            sender,
            accepted: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ops pushed onto the replay queue
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Bodies that did not decode or could not be queued
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Create the ingestion router
pub fn ingest_router(state: IngestState) -> Router {
    Router::new().route("/", post(ingest_op)).with_state(state)
}

async fn ingest_op(State(state): State<IngestState>, body: Bytes) -> &'static str {
    let op = match RecordedOp::from_bytes(&body) {
        Ok(op) => op,
        Err(e) => {
            warn!(error = %e, bytes = body.len(), "Rejecting undecodable op");
            state.rejected.fetch_add(1, Ordering::Relaxed);
            return ERROR_BODY;
        }
    };
    debug!(
        connection = op.seen_connection_num,
        order = op.order,
        "Op received"
    );
    if state.sender.send(op).await.is_err() {
        warn!("Replay queue closed, rejecting op");
        state.rejected.fetch_add(1, Ordering::Relaxed);
        return ERROR_BODY;
    }
    state.accepted.fetch_add(1, Ordering::Relaxed);
    SUCCESS_BODY
}

/// Bind `config.listen` and replay whatever is posted until `shutdown`
pub async fn serve<F>(
    config: &ServerConfig,
    context: ExecutionContext,
    shutdown: F,
) -> Result<PlaybackSummary>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(&config.listen).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            WireReplayError::Http(format!(
                "listen address {} is already in use; pick another with --listen",
                config.listen
            ))
        } else {
            WireReplayError::Http(format!("failed to bind {}: {}", config.listen, e))
        }
    })?;
    serve_listener(listener, config.queue_capacity, context, shutdown).await
}

/// Replay posted ops using an already bound listener
///
/// The server stops on `shutdown` or when the replay aborts; the replay then
/// drains whatever was queued and its summary is returned.
pub async fn serve_listener<F>(
    listener: TcpListener,
    queue_capacity: usize,
    context: ExecutionContext,
    shutdown: F,
) -> Result<PlaybackSummary>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
    let state = IngestState::new(sender);
    let router = ingest_router(state.clone());
    drop(state);

    let aborted = context.cancellation();
    let replay = tokio::spawn(async move { context.play(OpStream::from_receiver(receiver)).await });

    let addr = listener.local_addr()?;
    info!(addr = %addr, "Ingestion server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown => {}
                _ = aborted.cancelled() => {}
            }
        })
        .await?;
    info!("Ingestion server stopped, draining replay");

    replay
        .await
        .map_err(|e| WireReplayError::Other(format!("replay task failed: {}", e)))?
}
