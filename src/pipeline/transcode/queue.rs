use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::engine::TranscodeEngine;
use super::operation::{TranscodeError, TranscodeOperation};

struct QueuedOperation {
    operation: TranscodeOperation,
    reply: oneshot::Sender<Result<Vec<u8>, TranscodeError>>,
}

/// Serializes every operation against the single transcoding engine.
///
/// Operations run one at a time, in submission order, on a dedicated worker task
/// that owns the engine. A failed operation is reported to its caller and the worker
/// moves on to the next one.
pub struct TranscodeQueue {
    sender: mpsc::UnboundedSender<QueuedOperation>,
    pending: Arc<AtomicUsize>,
}

impl TranscodeQueue {
    /// Takes ownership of `engine` and starts the worker. Must be called within a
    /// Tokio runtime.
    pub fn new(engine: Box<dyn TranscodeEngine>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(drain(engine, receiver, pending.clone()));
        Self { sender, pending }
    }

    /// Queues `operation` and resolves once it has fully run against the engine.
    pub async fn enqueue(&self, operation: TranscodeOperation) -> Result<Vec<u8>, TranscodeError> {
        let (reply, response) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self
            .sender
            .send(QueuedOperation { operation, reply })
            .is_err()
        {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(TranscodeError::QueueClosed);
        }
        response.await.map_err(|_| TranscodeError::QueueClosed)?
    }

    /// Operations queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn ensure_loaded(engine: &mut dyn TranscodeEngine) -> Result<(), TranscodeError> {
    if !engine.is_loaded() {
        info!("Loading transcoding engine");
        engine.load().await?;
    }
    Ok(())
}

async fn drain(
    mut engine: Box<dyn TranscodeEngine>,
    mut receiver: mpsc::UnboundedReceiver<QueuedOperation>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(QueuedOperation { operation, reply }) = receiver.recv().await {
        let id = operation.id.clone();
        let result = if operation.cancel.is_cancelled() {
            debug!("Skipping cancelled transcode operation {}", id);
            Err(TranscodeError::Cancelled(id))
        } else {
            match ensure_loaded(engine.as_mut()).await {
                Ok(()) => operation.execute(engine.as_mut()).await,
                Err(e) => {
                    error!("Transcoding engine failed to load: {}", e);
                    Err(e)
                }
            }
        };
        pending.fetch_sub(1, Ordering::SeqCst);
        // The caller may have gone away; the engine is free either way.
        let _ = reply.send(result);
    }
    debug!("Transcoding queue closed");
}
