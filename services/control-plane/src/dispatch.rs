//! Per-node task dispatch.
//!
//! A node holds at most one live connection. Each connection owns a bounded
//! outbox that the connection's writer drains in order; [`DispatchChannel::send`]
//! only enqueues and never waits on the node. Nothing here is persisted: a task
//! queued on a connection that goes away is dropped, and re-issuing it is the
//! caller's decision.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fleet_events::{NodeStatus, ResourceKind, TaskEnvelope, TaskStatus};
use fleet_id::{NodeId, TaskId};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::crypto::hash_token;
use crate::store::{Store, StoreError, TaskRecord};

/// Maximum tasks waiting to be written on one connection.
pub const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid node credentials")]
    InvalidCredentials,

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Outbox {
    queue: Mutex<VecDeque<TaskEnvelope>>,
    ready: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, VecDeque<TaskEnvelope>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, task: TaskEnvelope) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.queue();
            if queue.len() >= self.capacity {
                return false;
            }
            queue.push_back(task);
        }
        self.ready.notify_one();
        true
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue().clear();
        self.ready.notify_one();
    }
}

struct Connection {
    session: u64,
    outbox: Arc<Outbox>,
}

#[derive(Default)]
struct Connections {
    by_node: RwLock<HashMap<NodeId, Connection>>,
}

impl Connections {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<NodeId, Connection>> {
        self.by_node.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<NodeId, Connection>> {
        self.by_node.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove the node's connection only if it is still `session`.
    fn release(&self, node_id: NodeId, session: u64) -> bool {
        let mut map = self.write();
        match map.get(&node_id) {
            Some(conn) if conn.session == session => {
                if let Some(conn) = map.remove(&node_id) {
                    conn.outbox.close();
                }
                true
            }
            _ => false,
        }
    }
}

/// Registry of live node connections.
pub struct DispatchChannel {
    store: Arc<dyn Store>,
    connections: Arc<Connections>,
    next_session: AtomicU64,
    outbox_capacity: usize,
}

impl DispatchChannel {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_capacity(store, OUTBOX_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn Store>, outbox_capacity: usize) -> Self {
        Self {
            store,
            connections: Arc::new(Connections::default()),
            next_session: AtomicU64::new(1),
            outbox_capacity,
        }
    }

    /// Authenticate a node by its per-node secret and register its
    /// connection. A previous connection for the same node is closed.
    pub async fn connect(
        &self,
        node_id: NodeId,
        secret: &str,
    ) -> Result<NodeSession, DispatchError> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(DispatchError::InvalidCredentials)?;

        let authenticated = node.status != NodeStatus::Pending
            && node
                .secret_hash
                .as_deref()
                .is_some_and(|stored| stored == hash_token(secret));
        if !authenticated {
            warn!(node_id = %node_id, "rejected dispatch connection");
            return Err(DispatchError::InvalidCredentials);
        }

        Ok(self.attach(node_id))
    }

    /// Register a connection for an already authenticated node.
    pub fn attach(&self, node_id: NodeId) -> NodeSession {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let outbox = Arc::new(Outbox::new(self.outbox_capacity));

        let previous = self.connections.write().insert(
            node_id,
            Connection {
                session,
                outbox: outbox.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.outbox.close();
            info!(node_id = %node_id, "replaced existing dispatch connection");
        } else {
            info!(node_id = %node_id, session, "node connected");
        }

        NodeSession {
            node_id,
            session,
            outbox,
            connections: self.connections.clone(),
        }
    }

    /// True while an authenticated connection for the node is held.
    pub fn is_online(&self, node_id: NodeId) -> bool {
        self.connections.read().contains_key(&node_id)
    }

    /// Enqueue a task on the node's connection. Returns false without
    /// waiting if the node is not connected or its outbox is full.
    pub fn send(&self, node_id: NodeId, task: TaskEnvelope) -> bool {
        let outbox = match self.connections.read().get(&node_id) {
            Some(conn) => conn.outbox.clone(),
            None => {
                debug!(node_id = %node_id, task_type = %task.task_type, "node not connected");
                return false;
            }
        };

        let task_id = task.task_id;
        let delivered = outbox.push(task);
        if !delivered {
            warn!(node_id = %node_id, task_id = %task_id, "dispatch outbox full or closed");
        }
        delivered
    }

    /// Drop tasks for a resource that are still waiting in the node's
    /// outbox. Returns the ids of the dropped tasks.
    pub fn cancel_pending(
        &self,
        node_id: NodeId,
        resource_kind: ResourceKind,
        resource_id: &str,
    ) -> Vec<TaskId> {
        let Some(outbox) = self
            .connections
            .read()
            .get(&node_id)
            .map(|c| c.outbox.clone())
        else {
            return Vec::new();
        };

        let mut dropped = Vec::new();
        outbox.queue().retain(|t| {
            let matches = t.resource_kind == resource_kind && t.resource_id == resource_id;
            if matches {
                dropped.push(t.task_id);
            }
            !matches
        });
        dropped
    }

    /// [`DispatchChannel::send`], plus an audit record of the decision.
    pub async fn dispatch(
        &self,
        node_id: NodeId,
        task: TaskEnvelope,
    ) -> Result<bool, DispatchError> {
        let task_id = task.task_id;
        let task_type = task.task_type;
        let resource_kind = task.resource_kind;
        let resource_id = task.resource_id.clone();
        let created_at = task.issued_at;

        let delivered = self.send(node_id, task);
        let record = TaskRecord {
            task_id,
            node_id,
            task_type,
            resource_kind,
            resource_id,
            status: if delivered {
                TaskStatus::Queued
            } else {
                TaskStatus::Undeliverable
            },
            created_at,
        };
        self.store.record_task(&record).await?;

        info!(
            node_id = %node_id,
            task_id = %record.task_id,
            task_type = %record.task_type,
            resource_id = %record.resource_id,
            delivered,
            "task dispatched"
        );
        Ok(delivered)
    }

    /// [`DispatchChannel::cancel_pending`], marking the dropped tasks
    /// cancelled in the audit log.
    pub async fn cancel_resource(
        &self,
        node_id: NodeId,
        resource_kind: ResourceKind,
        resource_id: &str,
    ) -> Result<usize, DispatchError> {
        let dropped = self.cancel_pending(node_id, resource_kind, resource_id);
        if !dropped.is_empty() {
            self.store.cancel_tasks(&dropped).await?;
            info!(node_id = %node_id, resource_id, cancelled = dropped.len(), "cancelled pending tasks");
        }
        Ok(dropped.len())
    }

    /// Close and forget the node's connection, if any.
    pub fn evict(&self, node_id: NodeId) -> bool {
        match self.connections.write().remove(&node_id) {
            Some(conn) => {
                conn.outbox.close();
                info!(node_id = %node_id, "evicted dispatch connection");
                true
            }
            None => false,
        }
    }

    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.connections.read().keys().copied().collect()
    }
}

/// The receiving end of one node connection.
///
/// Dropping the session unregisters it, unless a newer connection for the
/// same node has already taken its place.
pub struct NodeSession {
    node_id: NodeId,
    session: u64,
    outbox: Arc<Outbox>,
    connections: Arc<Connections>,
}

impl NodeSession {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// Next task to write, in enqueue order. Returns `None` once the
    /// connection has been closed or replaced.
    pub async fn next_task(&self) -> Option<TaskEnvelope> {
        loop {
            if self.outbox.closed.load(Ordering::Acquire) {
                return None;
            }
            let next = self.outbox.queue().pop_front();
            if next.is_some() {
                return next;
            }
            self.outbox.ready.notified().await;
        }
    }

    /// Non-blocking variant of [`NodeSession::next_task`].
    pub fn try_next_task(&self) -> Option<TaskEnvelope> {
        if self.outbox.closed.load(Ordering::Acquire) {
            return None;
        }
        self.outbox.queue().pop_front()
    }
}

impl Drop for NodeSession {
    fn drop(&mut self) {
        if self.connections.release(self.node_id, self.session) {
            info!(node_id = %self.node_id, session = self.session, "node disconnected");
        }
    }
}
