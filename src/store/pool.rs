/// Worker pool staging durable operations onto per-connection workers.
///
/// Each worker is a task owning its own database connection. Submitted
/// tasks flow through a shared queue; the caller awaits a oneshot reply,
/// which is what bounds the rate a connection can offer new work. If no
/// worker is idle when a task is submitted a new worker is spawned, so the
/// pool can never deadlock the write path by being sized below the number
/// of concurrent writers.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sqlx::PgConnection;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error};

use crate::error::WmResult;
use crate::types::{Attribute, Timestamp, Uri, WorldState};

use super::postgres::{self, PgSettings};

/// One durable operation, mirroring the `AttributeStore` capability set.
#[derive(Debug)]
pub(crate) enum StoreRequest {
    Store {
        uri: Uri,
        entries: Vec<Attribute>,
    },
    UpdateExpiration {
        uri: Uri,
        entries: Vec<Attribute>,
    },
    DeleteUri {
        uri: Uri,
    },
    DeleteAttributes {
        uri: Uri,
        entries: Vec<(String, String)>,
    },
    FetchCurrent {
        uri_pattern: String,
        attr_pattern: String,
        origin_pattern: String,
    },
    FetchSnapshotAt {
        uri_pattern: String,
        attr_pattern: String,
        origin_pattern: String,
        at: Timestamp,
    },
    FetchRange {
        uri_pattern: String,
        attr_pattern: String,
        origin_pattern: String,
        from: Timestamp,
        to: Timestamp,
    },
}

/// Reply to a [`StoreRequest`].
pub(crate) enum StoreReply {
    Fragment(WorldState),
    Unit(WmResult<()>),
}

impl StoreReply {
    /// The reply a failed task degrades to.
    fn empty_for(request: &StoreRequest) -> Self {
        match request {
            StoreRequest::DeleteUri { .. } => StoreReply::Unit(Ok(())),
            _ => StoreReply::Fragment(WorldState::new()),
        }
    }
}

type Job = (StoreRequest, oneshot::Sender<StoreReply>);

/// Pool of database workers fed over a shared queue.
pub(crate) struct WorkerPool {
    settings: PgSettings,
    tx: mpsc::UnboundedSender<Job>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    idle: Arc<AtomicUsize>,
    spawned: AtomicUsize,
}

impl WorkerPool {
    pub(crate) fn new(settings: PgSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            settings,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            idle: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Hand a task to an idle worker, spawning one when all are busy, and
    /// wait for its reply.
    pub(crate) async fn submit(&self, request: StoreRequest) -> StoreReply {
        if self.idle.load(Ordering::Acquire) == 0 {
            self.spawn_worker();
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let fallback = StoreReply::empty_for(&request);
        if self.tx.send((request, reply_tx)).is_err() {
            error!("persistence pool is shut down; task dropped");
            return fallback;
        }
        match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => {
                error!("persistence worker dropped a task reply");
                fallback
            }
        }
    }

    fn spawn_worker(&self) {
        let worker_id = self.spawned.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(worker_id, "spawning persistence worker");
        tokio::spawn(worker_loop(
            worker_id,
            self.settings.clone(),
            Arc::clone(&self.rx),
            Arc::clone(&self.idle),
        ));
    }
}

/// A worker owns one connection for its whole life, re-establishing it on
/// the task after a loss.
async fn worker_loop(
    worker_id: usize,
    settings: PgSettings,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    idle: Arc<AtomicUsize>,
) {
    let mut connection: Option<PgConnection> = None;
    loop {
        idle.fetch_add(1, Ordering::AcqRel);
        let job = {
            let mut queue = rx.lock().await;
            queue.recv().await
        };
        idle.fetch_sub(1, Ordering::AcqRel);
        let Some((request, reply)) = job else {
            // Pool dropped; workers drain out.
            debug!(worker_id, "persistence worker exiting");
            return;
        };

        if connection.is_none() {
            match postgres::establish(&settings).await {
                Ok(conn) => connection = Some(conn),
                Err(err) => {
                    error!(worker_id, %err, "could not establish database connection");
                }
            }
        }

        let outcome = match connection.as_mut() {
            Some(conn) => postgres::execute(conn, &request).await,
            None => Err(crate::error::WmError::Persistence(
                "no database connection".to_string(),
            )),
        };
        match outcome {
            Ok(result) => {
                let _ = reply.send(result);
            }
            Err(err) => {
                error!(worker_id, %err, ?request, "persistence task failed");
                // Force a reconnect attempt on the next task.
                connection = None;
                let _ = reply.send(StoreReply::empty_for(&request));
            }
        }
    }
}
