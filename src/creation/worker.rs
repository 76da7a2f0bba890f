//! Background worker pool for delegated partition creation
//!
//! Requests travel over a queue to a tokio runtime owned by the pool; each one
//! executes on a blocking thread inside its own transaction. The submitting
//! backend blocks on a oneshot reply, bounded by the worker timeout. A request
//! that times out keeps running and commits or rolls back on its own.

use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::core::{DatabaseId, PathmanError, RelationId, Result, Value};
use super::orchestrator::{CreationOutcome, InlineCreator};

const QUEUE_DEPTH: usize = 64;

/// Create (or find) the partition of `relid` covering `value`
#[derive(Debug, Clone, PartialEq)]
pub struct CreationRequest {
    pub database: DatabaseId,
    pub relid: RelationId,
    pub value: Value,
}

pub type CreationResponse = Result<CreationOutcome>;

struct Job {
    request: CreationRequest,
    reply: oneshot::Sender<CreationResponse>,
}

pub struct BgWorkerPool {
    runtime: Runtime,
    queue: mpsc::Sender<Job>,
    timeout: Duration,
}

impl std::fmt::Debug for BgWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BgWorkerPool").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

impl BgWorkerPool {
    pub(crate) fn start(creator: InlineCreator, threads: usize, timeout: Duration) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("pathman-bgw")
            .enable_all()
            .build()?;
        let (queue, mut jobs) = mpsc::channel::<Job>(QUEUE_DEPTH);

        runtime.spawn(async move {
            while let Some(Job { request, reply }) = jobs.recv().await {
                let creator = creator.clone();
                tokio::spawn(async move {
                    let relid = request.relid;
                    let response = tokio::task::spawn_blocking(move || creator.run_request(&request))
                        .await
                        .unwrap_or_else(|e| {
                            error!(relid, error = %e, "background worker crashed");
                            Err(PathmanError::CreationFailure(format!("background worker crashed: {e}")))
                        });
                    if reply.send(response).is_err() {
                        debug!(relid, "backend stopped waiting, result discarded");
                    }
                });
            }
        });

        debug!(threads, ?timeout, "background worker pool started");
        Ok(Self {
            runtime,
            queue,
            timeout,
        })
    }

    /// Submits a request and blocks until its reply or the timeout
    pub fn submit(&self, request: CreationRequest) -> Result<CreationOutcome> {
        let relid = request.relid;
        let (reply, response) = oneshot::channel();

        self.runtime.block_on(async {
            self.queue
                .send(Job { request, reply })
                .await
                .map_err(|_| PathmanError::CreationFailure("background worker pool is shut down".to_string()))?;

            match tokio::time::timeout(self.timeout, response).await {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => Err(PathmanError::CreationFailure(
                    "background worker dropped the request".to_string(),
                )),
                Err(_) => {
                    warn!(relid, timeout = ?self.timeout, "timed out waiting for background worker");
                    Err(PathmanError::CreationFailure(format!(
                        "background worker did not answer within {:?}",
                        self.timeout
                    )))
                }
            }
        })
    }
}
