//! Best-effort replication of committed writes. The request path only
//! enqueues; a single background dispatcher drains the queue and pushes
//! each write to every replica with a short retry loop. Replica failures
//! are logged and never surfaced to the caller.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::proto::{self, Replicate, Request, Response};

pub const REPL_RETRY: usize = 2;
pub const REPL_TIMEOUT: Duration = Duration::from_secs(2);
const RETRY_DELAY: Duration = Duration::from_millis(100);
const QUEUE_DEPTH: usize = 256;

pub struct Replicator {
    tx: Option<SyncSender<Replicate>>,
}

impl Replicator {
    /// With no replicas configured every enqueue is a no-op and no
    /// dispatcher thread is spawned.
    pub fn new(replicas: Vec<(String, u16)>) -> Self {
        if replicas.is_empty() {
            return Self { tx: None };
        }
        let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        thread::spawn(move || dispatch(rx, replicas));
        Self { tx: Some(tx) }
    }

    pub fn is_disabled(&self) -> bool {
        self.tx.is_none()
    }

    /// Hand a committed write to the dispatcher. A full queue drops the
    /// message: the primary's success never depends on replica progress.
    pub fn enqueue(&self, msg: Replicate) {
        let Some(tx) = &self.tx else { return };
        if let Err(e) = tx.try_send(msg) {
            warn!(error = %e, "replication queue full, dropping update");
        }
    }
}

fn dispatch(rx: Receiver<Replicate>, replicas: Vec<(String, u16)>) {
    while let Ok(msg) = rx.recv() {
        for (host, port) in &replicas {
            push_to_replica(host, *port, &msg);
        }
    }
}

fn push_to_replica(host: &str, port: u16, msg: &Replicate) {
    let req = Request::Replicate(msg.clone());
    let mut last_err = None;
    for attempt in 0..REPL_RETRY {
        match proto::send_request(host, port, &req, REPL_TIMEOUT) {
            Response::Ok { .. } => {
                debug!(replica = %format!("{host}:{port}"), seq = msg.seq, "replicated");
                return;
            }
            Response::Error { error } => {
                last_err = Some(error);
                if attempt + 1 < REPL_RETRY {
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }
    warn!(
        replica = %format!("{host}:{port}"),
        seq = msg.seq,
        error = last_err.as_deref().unwrap_or("unknown"),
        "replication failed"
    );
}
