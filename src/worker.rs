//! Dedicated task that owns the relay and serves requests one at a time.
//!
//! A job is driven to a terminal state even when the caller stops waiting,
//! so an abandoned request can never leave the gate held or a half-read turn
//! behind for the next one.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ExchangeError;
use crate::exchange::{ChatRelay, ExchangeRequest, ExtractedResponse};
use crate::session::Session;

const QUEUE_DEPTH: usize = 32;

type Reply = oneshot::Sender<Result<ExtractedResponse, ExchangeError>>;

struct Job {
    request: ExchangeRequest,
    reply: Reply,
}

/// Cloneable submission side of a [`RelayWorker`].
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Job>,
}

impl RelayHandle {
    pub async fn send(&self, request: ExchangeRequest) -> Result<ExtractedResponse, ExchangeError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { request, reply })
            .await
            .map_err(|_| ExchangeError::WorkerClosed)?;
        rx.await.map_err(|_| ExchangeError::WorkerClosed)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct RelayWorker;

impl RelayWorker {
    /// Start the worker. It stops once every handle is dropped.
    pub fn spawn<S: Session + 'static>(relay: Arc<ChatRelay<S>>) -> (RelayHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            info!("relay worker started");
            let mut served = 0u64;
            while let Some(Job { request, reply }) = rx.recv().await {
                served += 1;
                debug!(job = served, "exchange dequeued");
                let result = relay.send_exchange(request).await;
                if reply.send(result).is_err() {
                    warn!(job = served, "caller went away before the reply was ready");
                }
            }
            info!(served, "relay worker stopped");
        });
        (RelayHandle { tx }, task)
    }
}
