//! Master-side replica registry and the `WAIT` ack protocol (component C5,
//! master half). Grounded on the teacher's `MasterServer`/`Replica`
//! bookkeeping, translated from `std::sync::mpsc` + `std::thread` onto
//! `tokio::sync::mpsc` channels so a connection's write-half task can be
//! driven purely by `.await`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::resp::Resp;

/// One registered replica link: a channel the connection's write task drains
/// to forward replicated bytes, plus the offset it last acknowledged via
/// `REPLCONF ACK`.
pub struct ReplicaHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    ack_offset: AtomicU64,
}

impl ReplicaHandle {
    pub fn record_ack(&self, offset: u64) {
        self.ack_offset.store(offset, Ordering::SeqCst);
    }

    fn send(&self, bytes: &[u8]) -> bool {
        self.tx.send(bytes.to_vec()).is_ok()
    }
}

/// Master-side replication bookkeeping: the monotonically increasing
/// replication offset and the set of connected replicas.
pub struct ReplicationState {
    master_repl_offset: AtomicU64,
    replicas: RwLock<Vec<Arc<ReplicaHandle>>>,
    next_id: AtomicU64,
}

impl ReplicationState {
    pub fn new() -> Self {
        ReplicationState {
            master_repl_offset: AtomicU64::new(0),
            replicas: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn master_repl_offset(&self) -> u64 {
        self.master_repl_offset.load(Ordering::SeqCst)
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.read().unwrap().len()
    }

    /// Registers a new replica link and returns its handle (for ack
    /// bookkeeping) and the receiver the connection's write task should
    /// drain to learn what to forward.
    pub fn register(&self) -> (Arc<ReplicaHandle>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ReplicaHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            tx,
            ack_offset: AtomicU64::new(0),
        });
        self.replicas.write().unwrap().push(handle.clone());
        info!(replica_id = handle.id, "replica registered");
        (handle, rx)
    }

    pub fn deregister(&self, handle: &Arc<ReplicaHandle>) {
        self.replicas.write().unwrap().retain(|r| r.id != handle.id);
        info!(replica_id = handle.id, "replica deregistered");
    }

    /// Forwards a raw, already-encoded command frame to every connected
    /// replica and advances `master_repl_offset` by its length. Only
    /// mutating commands go through this path; `WAIT`'s `REPLCONF GETACK`
    /// probe deliberately does not, matching upstream's accounting.
    pub fn propagate(&self, frame: &[u8]) {
        let replicas = self.replicas.read().unwrap();
        if replicas.is_empty() {
            return;
        }
        debug!(len = frame.len(), count = replicas.len(), "propagating to replicas");
        let dead: Vec<u64> = replicas
            .iter()
            .filter(|r| !r.send(frame))
            .map(|r| r.id)
            .collect();
        drop(replicas);
        if !dead.is_empty() {
            self.replicas.write().unwrap().retain(|r| !dead.contains(&r.id));
        }
        self.master_repl_offset.fetch_add(frame.len() as u64, Ordering::SeqCst);
    }

    /// `WAIT numreplicas timeout_ms`. If nothing has ever been replicated,
    /// every connected replica already satisfies the request. Otherwise a
    /// `REPLCONF GETACK *` probe is broadcast (without touching
    /// `master_repl_offset`) and the caller polls `ack_offset` until enough
    /// replicas have caught up or the timeout elapses.
    pub async fn wait_for_acks(&self, num_replicas: usize, timeout_ms: u64) -> usize {
        let target = self.master_repl_offset();
        let replicas: Vec<_> = self.replicas.read().unwrap().clone();
        if target == 0 {
            return replicas.len();
        }

        let getack = Resp::Array(vec![
            Resp::bulk("REPLCONF"),
            Resp::bulk("GETACK"),
            Resp::bulk("*"),
        ])
        .encode();
        for replica in &replicas {
            replica.send(&getack);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let acked = replicas
                .iter()
                .filter(|r| r.ack_offset.load(Ordering::SeqCst) >= target)
                .count();
            if acked >= num_replicas || tokio::time::Instant::now() >= deadline {
                return acked;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::new()
    }
}
