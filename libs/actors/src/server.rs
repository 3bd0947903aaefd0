//! The process server
//!
//! A `ProcessServer` hosts the process table for one node: it mints
//! process ids, owns every `ProcessInstance`, routes channel listener
//! registrations between them, and answers admin queries for its slice of
//! the cluster. Maintenance (checkpoint flushing, dormancy suspension,
//! notifier eviction) is exposed as explicit sweep methods so the
//! embedding service decides the cadence.

use crate::channel::{BroadcastQueue, NOTIFIER_EVICTION_TIMEOUT};
use crate::client::ServiceClient;
use crate::cluster::{Cluster, QueryEndpoint, ServersQuery};
use crate::instance::{deliver_signal, InstanceInner, KILL_SIGNAL};
use crate::operation::{LifecycleState, OperationFactory, ProcessInfo};
use crate::state::{MemoryStateStore, StateMap, StateStore, FLUSH_LOCK_WAIT};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use types::{
    ProcessChannel, ProcessId, ProcessUnavailable, ServiceAddress, UnavailableReason,
};

type ClosedKey = (String, String, String);

/// One process subscribed to a broadcast channel. `delivered` is the
/// highest sequence already handed to the listener; live fan-out and
/// cursor replay both gate on it, so overlapping the two can never
/// deliver a sequence twice.
pub(crate) struct ListenerEntry {
    instance: Weak<InstanceInner>,
    delivered: Arc<AtomicI64>,
}

pub(crate) struct ServerInner {
    name: String,
    address: ServiceAddress,
    partition: u8,
    /// (millis, counter) of the last minted id; ids stay unique and
    /// ascending even when several are minted in the same millisecond.
    next_unique: Mutex<(i64, i64)>,
    instances: RwLock<HashMap<ProcessId, Arc<InstanceInner>>>,
    listeners: Mutex<HashMap<ProcessChannel, Vec<ListenerEntry>>>,
    store: Arc<dyn StateStore>,
    /// Closed-process tally per (account, app, class), kept so summary
    /// queries can still report processes that no longer exist.
    closed: Mutex<HashMap<ClosedKey, u64>>,
    cluster: RwLock<Option<Cluster>>,
    client_call_id: AtomicI32,
}

impl ServerInner {
    pub(crate) fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub(crate) fn address(&self) -> &ServiceAddress {
        &self.address
    }

    pub(crate) fn next_client_call_id(&self) -> i32 {
        self.client_call_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn instance(&self, id: ProcessId) -> Option<Arc<InstanceInner>> {
        self.instances.read().get(&id).cloned()
    }

    fn mint_id(&self) -> ProcessId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let mut unique = self.next_unique.lock();
        if now > unique.0 {
            *unique = (now, 0);
        } else {
            unique.1 += 1;
        }
        ProcessId::new(self.partition, unique.0, unique.1)
    }

    /// Drops a closed process from the table and records it in the
    /// closed tally.
    pub(crate) fn forget(&self, id: ProcessId) {
        let removed = self.instances.write().remove(&id);
        if let Some(instance) = removed {
            self.store.remove(id);
            let info = instance.info();
            let key = (info.account, info.app_name, info.process_class);
            *self.closed.lock().entry(key).or_insert(0) += 1;
        }
    }

    /// The broadcast queue behind `channel`, owned by its broadcaster.
    pub(crate) fn resolve_queue(
        &self,
        channel: ProcessChannel,
    ) -> Result<Arc<BroadcastQueue>, ProcessUnavailable> {
        match self.instance(channel.process_id()) {
            Some(instance) => Ok(instance.broadcast_queue(channel.number())),
            None => Err(ProcessUnavailable::new(
                UnavailableReason::Unavailable,
                self.address.clone(),
                format!("no broadcaster process {}", channel.process_id()),
            )),
        }
    }

    /// Subscribes `listener` to `channel`, starting its delivery mark at
    /// `delivered_up_to`. Re-registering an existing listener keeps its
    /// mark, so a repeated subscription cannot rewind it. Returns the
    /// mark for the caller's replay to gate on.
    pub(crate) fn add_listener(
        &self,
        channel: ProcessChannel,
        listener: Weak<InstanceInner>,
        delivered_up_to: i64,
    ) -> Arc<AtomicI64> {
        let mut listeners = self.listeners.lock();
        let slot = listeners.entry(channel).or_default();
        slot.retain(|entry| entry.instance.strong_count() > 0);
        let existing = slot.iter().find(|entry| {
            entry
                .instance
                .upgrade()
                .zip(listener.upgrade())
                .is_some_and(|(a, b)| Arc::ptr_eq(&a, &b))
        });
        if let Some(entry) = existing {
            return entry.delivered.clone();
        }
        let delivered = Arc::new(AtomicI64::new(delivered_up_to));
        slot.push(ListenerEntry {
            instance: listener,
            delivered: delivered.clone(),
        });
        delivered
    }

    pub(crate) fn remove_listener(&self, channel: ProcessChannel, listener: &InstanceInner) {
        let mut listeners = self.listeners.lock();
        if let Some(slot) = listeners.get_mut(&channel) {
            slot.retain(|entry| {
                entry
                    .instance
                    .upgrade()
                    .is_some_and(|strong| !std::ptr::eq(strong.as_ref(), listener))
            });
            if slot.is_empty() {
                listeners.remove(&channel);
            }
        }
    }

    /// Live listeners of `channel` with their delivery marks; dead
    /// registrations are pruned on the way through.
    pub(crate) fn listeners_of(
        &self,
        channel: ProcessChannel,
    ) -> Vec<(Arc<InstanceInner>, Arc<AtomicI64>)> {
        let mut listeners = self.listeners.lock();
        match listeners.get_mut(&channel) {
            Some(slot) => {
                slot.retain(|entry| entry.instance.strong_count() > 0);
                slot.iter()
                    .filter_map(|entry| {
                        entry
                            .instance
                            .upgrade()
                            .map(|strong| (strong, entry.delivered.clone()))
                    })
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// Runs `query` across the joined cluster, or locally when this
    /// server stands alone.
    pub(crate) async fn cluster_execute(self: &Arc<Self>, query: &ServersQuery) -> serde_json::Value {
        let cluster = self.cluster.read().clone();
        match cluster {
            Some(cluster) => {
                let results = cluster.execute(query).await;
                serde_json::to_value(&results).unwrap_or(serde_json::Value::Null)
            }
            None => {
                let mut results = serde_json::Map::new();
                results.insert(
                    self.name.clone(),
                    serde_json::json!({ "ok": self.local_execute(query) }),
                );
                serde_json::Value::Object(results)
            }
        }
    }

    fn matching(&self, account: &str, app_name: &str, class: Option<&str>) -> Vec<Arc<InstanceInner>> {
        self.instances
            .read()
            .values()
            .filter(|instance| instance.matches(account, app_name, class))
            .cloned()
            .collect()
    }

    fn local_execute(&self, query: &ServersQuery) -> serde_json::Value {
        match query {
            ServersQuery::ProcessSummary {
                account,
                app_name,
                process_class,
            } => {
                // Per class: [live, suspended, closed].
                let mut summary: BTreeMap<String, [u64; 3]> = BTreeMap::new();
                for instance in self.matching(account, app_name, process_class.as_deref()) {
                    let counts = summary.entry(instance.process_class().to_string()).or_default();
                    match instance.lifecycle() {
                        LifecycleState::Created | LifecycleState::Active => counts[0] += 1,
                        LifecycleState::Suspended => counts[1] += 1,
                        LifecycleState::Closed => {}
                    }
                }
                for ((acct, app, class), count) in self.closed.lock().iter() {
                    let class_matches = process_class
                        .as_deref()
                        .map_or(true, |wanted| wanted == class.as_str());
                    if acct == account && app == app_name && class_matches {
                        summary.entry(class.clone()).or_default()[2] += count;
                    }
                }
                serde_json::json!(summary)
            }
            ServersQuery::AllProcessIdsOf {
                account,
                app_name,
                process_class,
            } => {
                let details: BTreeMap<String, ProcessInfo> = self
                    .matching(account, app_name, process_class.as_deref())
                    .into_iter()
                    .map(|instance| (instance.id().to_string(), instance.info()))
                    .collect();
                serde_json::json!(details)
            }
            ServersQuery::CloseProcessId { id } => {
                let found = self.instance(*id);
                if let Some(instance) = &found {
                    instance.close();
                }
                serde_json::json!(found.is_some())
            }
            ServersQuery::CloseOlderThan {
                account,
                app_name,
                process_class,
                older_than_ms,
                hard_kill,
                count_only,
            } => {
                let targets: Vec<_> = self
                    .matching(account, app_name, process_class.as_deref())
                    .into_iter()
                    .filter(|instance| (instance.created_at_ms() as i64) <= *older_than_ms)
                    .collect();
                let affected = targets.len();
                if !count_only {
                    for instance in targets {
                        if *hard_kill {
                            instance.close();
                        } else {
                            deliver_signal(&instance, vec![KILL_SIGNAL.to_string()]);
                        }
                    }
                }
                serde_json::json!(affected)
            }
            ServersQuery::AllServerNames => {
                let names = match &*self.cluster.read() {
                    Some(cluster) => cluster.server_names(),
                    None => vec![self.name.clone()],
                };
                serde_json::json!(names)
            }
        }
    }
}

/// One node's process host.
#[derive(Clone)]
pub struct ProcessServer {
    inner: Arc<ServerInner>,
}

impl ProcessServer {
    pub fn new(name: impl Into<String>, partition: u8, store: Arc<dyn StateStore>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(ServerInner {
                address: ServiceAddress::new(name.clone()),
                name,
                partition,
                next_unique: Mutex::new((0, 0)),
                instances: RwLock::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                store,
                closed: Mutex::new(HashMap::new()),
                cluster: RwLock::new(None),
                client_call_id: AtomicI32::new(1),
            }),
        }
    }

    /// Server backed by an in-memory store; checkpoints do not survive
    /// the host.
    pub fn in_memory(name: impl Into<String>, partition: u8) -> Self {
        Self::new(name, partition, Arc::new(MemoryStateStore::new()))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn partition(&self) -> u8 {
        self.inner.partition
    }

    pub fn address(&self) -> &ServiceAddress {
        self.inner.address()
    }

    /// Client handle for callers outside any hosted process.
    pub fn client(&self) -> ServiceClient {
        ServiceClient::new(self.inner.clone())
    }

    /// Creates a process and returns its freshly minted id. The factory
    /// is probed once up front so the lifecycle kind is known even while
    /// the operation is suspended.
    pub fn create_process(
        &self,
        account: impl Into<String>,
        app_name: impl Into<String>,
        process_class: impl Into<String>,
        factory: OperationFactory,
    ) -> ProcessId {
        let id = self.inner.mint_id();
        let kind = factory().kind();
        let instance = InstanceInner::new(
            id,
            Arc::downgrade(&self.inner),
            factory,
            kind,
            account.into(),
            app_name.into(),
            process_class.into(),
            StateMap::new(),
            LifecycleState::Created,
        );
        self.inner.instances.write().insert(id, instance);
        tracing::debug!(process = %id, "process created");
        id
    }

    /// Re-registers a previously suspended process from its checkpointed
    /// state, typically after a host restart. Returns `false` when the
    /// store has no snapshot for the id.
    pub fn recover_process(
        &self,
        account: impl Into<String>,
        app_name: impl Into<String>,
        process_class: impl Into<String>,
        id: ProcessId,
        factory: OperationFactory,
    ) -> bool {
        let Some(snapshot) = self.inner.store.load(id) else {
            return false;
        };
        let kind = factory().kind();
        let instance = InstanceInner::new(
            id,
            Arc::downgrade(&self.inner),
            factory,
            kind,
            account.into(),
            app_name.into(),
            process_class.into(),
            StateMap::from_entries(snapshot),
            LifecycleState::Suspended,
        );
        self.inner.instances.write().insert(id, instance);
        tracing::info!(process = %id, "process recovered from checkpoint");
        true
    }

    pub fn process_info(&self, id: ProcessId) -> Option<ProcessInfo> {
        self.inner.instance(id).map(|instance| instance.info())
    }

    /// Delivers a signal, jumping the target's message queue. Signals to
    /// unknown processes are dropped; signalling is fire-and-forget.
    pub fn send_signal(&self, id: ProcessId, signal: Vec<String>) {
        match self.inner.instance(id) {
            Some(instance) => deliver_signal(&instance, signal),
            None => tracing::debug!(process = %id, "signal to unknown process dropped"),
        }
    }

    /// Suspends one process now. `force` overrides the operation's own
    /// dormancy report but never a busy queue.
    pub fn suspend_process(&self, id: ProcessId, force: bool) -> bool {
        self.inner
            .instance(id)
            .map_or(false, |instance| instance.suspend(force))
    }

    /// Dormancy sweep: suspends every suspendable process idle for at
    /// least `idle`. Returns how many were suspended.
    pub fn suspend_dormant(&self, idle: Duration) -> usize {
        let candidates: Vec<_> = self.inner.instances.read().values().cloned().collect();
        candidates
            .into_iter()
            .filter(|instance| instance.idle_for() >= idle && instance.suspend(false))
            .count()
    }

    /// Checkpoint sweep: flushes every dirty state map to the store.
    /// Returns how many snapshots were written.
    pub fn flush_checkpoints(&self) -> usize {
        let instances: Vec<_> = self.inner.instances.read().values().cloned().collect();
        instances
            .into_iter()
            .filter(|instance| instance.flush_checkpoint(FLUSH_LOCK_WAIT))
            .count()
    }

    /// Eviction sweep: fires `Timeout` on every notifier parked past the
    /// eviction deadline.
    pub fn expire_notifiers(&self) {
        let instances: Vec<_> = self.inner.instances.read().values().cloned().collect();
        for instance in instances {
            instance.expire_notifiers(NOTIFIER_EVICTION_TIMEOUT);
        }
    }

    /// Closes one process. Returns whether it was hosted here.
    pub fn close_process(&self, id: ProcessId) -> bool {
        match self.inner.instance(id) {
            Some(instance) => {
                instance.close();
                true
            }
            None => false,
        }
    }

    /// Joins this server to a cluster for scatter-gather queries.
    pub fn join_cluster(&self, cluster: Cluster) {
        *self.inner.cluster.write() = Some(cluster);
    }
}

impl std::fmt::Debug for ProcessServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessServer")
            .field("name", &self.inner.name)
            .field("partition", &self.inner.partition)
            .field("processes", &self.inner.instances.read().len())
            .finish()
    }
}

#[async_trait]
impl QueryEndpoint for ProcessServer {
    fn server_name(&self) -> &str {
        &self.inner.name
    }

    async fn execute(&self, query: &ServersQuery) -> Result<serde_json::Value, ProcessUnavailable> {
        Ok(self.inner.local_execute(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ProcessInstance;
    use crate::message::InputMessage;
    use crate::operation::{OperationType, ProcessOperation};
    use codec::ProcessMessage;

    struct Echo {
        kind: OperationType,
    }

    impl ProcessOperation for Echo {
        fn kind(&self) -> OperationType {
            self.kind
        }

        fn function(&mut self, instance: &ProcessInstance) {
            while let Some(message) = instance.consume_message() {
                if let InputMessage::FunctionInvoke { .. } = &message {
                    let payload = message.message().cloned().unwrap_or_default();
                    instance.send_reply(message, payload);
                }
            }
        }
    }

    fn echo_factory(kind: OperationType) -> OperationFactory {
        Arc::new(move || Box::new(Echo { kind }))
    }

    #[test]
    fn test_minted_ids_are_unique_and_ascending() {
        let server = ProcessServer::in_memory("alpha", 0x11);
        let mut prev = server.create_process("acme", "shop", "Echo", echo_factory(OperationType::Transient));
        for _ in 0..64 {
            let next =
                server.create_process("acme", "shop", "Echo", echo_factory(OperationType::Transient));
            assert!(next > prev, "{next} must sort after {prev}");
            assert_eq!(next.partition(), 0x11);
            prev = next;
        }
    }

    #[test]
    fn test_process_info_reflects_lifecycle() {
        let server = ProcessServer::in_memory("alpha", 1);
        let id = server.create_process("acme", "shop", "Echo", echo_factory(OperationType::Permanent));
        let info = server.process_info(id).unwrap();
        assert_eq!(info.process_class, "Echo");
        assert_eq!(info.state, LifecycleState::Created);

        assert!(server.close_process(id));
        assert!(server.process_info(id).is_none());
    }

    #[test]
    fn test_suspend_refuses_static_processes() {
        let server = ProcessServer::in_memory("alpha", 1);
        let id = server.create_process("acme", "shop", "Echo", echo_factory(OperationType::Static));
        assert!(!server.suspend_process(id, true));
        assert_eq!(
            server.process_info(id).unwrap().state,
            LifecycleState::Created
        );
    }

    #[test]
    fn test_idle_transient_suspends_and_resumes() {
        let server = ProcessServer::in_memory("alpha", 1);
        let id = server.create_process("acme", "shop", "Echo", echo_factory(OperationType::Transient));
        assert!(server.suspend_process(id, false));
        assert_eq!(
            server.process_info(id).unwrap().state,
            LifecycleState::Suspended
        );

        // Delivery rebuilds the operation from the factory on demand.
        let reply = server
            .client()
            .invoke_function(id, ProcessMessage::empty(), true)
            .unwrap()
            .unwrap();
        assert!(matches!(
            reply.result(),
            Some(InputMessage::Return { .. })
        ));
        assert_eq!(
            server.process_info(id).unwrap().state,
            LifecycleState::Active
        );
    }

    #[test]
    fn test_idle_permanent_suspends() {
        let server = ProcessServer::in_memory("alpha", 1);
        let durable =
            server.create_process("acme", "shop", "Echo", echo_factory(OperationType::Permanent));
        assert!(server.suspend_process(durable, false));
        assert_eq!(
            server.process_info(durable).unwrap().state,
            LifecycleState::Suspended
        );
    }

    struct Recorder {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    impl ProcessOperation for Recorder {
        fn function(&mut self, instance: &ProcessInstance) {
            while let Some(message) = instance.consume_message() {
                if let Some(state) = message.session_state() {
                    self.seen.lock().push(state.sequence());
                }
            }
        }
    }

    #[test]
    fn test_listener_never_sees_a_sequence_twice() {
        let server = ProcessServer::in_memory("alpha", 1);
        let source =
            server.create_process("acme", "shop", "Feed", echo_factory(OperationType::Transient));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder_seen = seen.clone();
        let listener = server.create_process(
            "acme",
            "shop",
            "Rec",
            Arc::new(move || {
                Box::new(Recorder {
                    seen: recorder_seen.clone(),
                }) as Box<dyn ProcessOperation>
            }),
        );

        let source_handle = ProcessInstance {
            inner: server.inner.instance(source).unwrap(),
        };
        let listener_handle = ProcessInstance {
            inner: server.inner.instance(listener).unwrap(),
        };
        let channel = ProcessChannel::new(source, 1);
        listener_handle.add_channel_listener(channel).unwrap();

        let first = source_handle.broadcast_message(1, ProcessMessage::empty());
        assert_eq!(*seen.lock(), vec![first.sequence()]);

        // Resubscribing from a cursor behind the live delivery must not
        // replay what already arrived.
        listener_handle
            .add_channel_listener_from(&channel.session_state(first.sequence() - 1))
            .unwrap();
        assert_eq!(*seen.lock(), vec![first.sequence()]);

        let second = source_handle.broadcast_message(1, ProcessMessage::empty());
        assert_eq!(*seen.lock(), vec![first.sequence(), second.sequence()]);
    }

    #[test]
    fn test_summary_counts_closed_processes() {
        let server = ProcessServer::in_memory("alpha", 1);
        let keep = server.create_process("acme", "shop", "Cart", echo_factory(OperationType::Transient));
        let gone = server.create_process("acme", "shop", "Cart", echo_factory(OperationType::Transient));
        server.create_process("acme", "shop", "Session", echo_factory(OperationType::Transient));
        assert!(server.close_process(gone));

        let summary = server.inner.local_execute(&ServersQuery::ProcessSummary {
            account: "acme".into(),
            app_name: "shop".into(),
            process_class: None,
        });
        assert_eq!(summary["Cart"], serde_json::json!([1, 0, 1]));
        assert_eq!(summary["Session"], serde_json::json!([1, 0, 0]));

        // Other applications are invisible.
        let other = server.inner.local_execute(&ServersQuery::ProcessSummary {
            account: "acme".into(),
            app_name: "blog".into(),
            process_class: None,
        });
        assert_eq!(other, serde_json::json!({}));
        let _ = keep;
    }

    #[test]
    fn test_close_older_than_count_only_does_not_close() {
        let server = ProcessServer::in_memory("alpha", 1);
        let id = server.create_process("acme", "shop", "Cart", echo_factory(OperationType::Transient));
        let future_cutoff = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
            + 60_000;

        let counted = server.inner.local_execute(&ServersQuery::CloseOlderThan {
            account: "acme".into(),
            app_name: "shop".into(),
            process_class: None,
            older_than_ms: future_cutoff,
            hard_kill: false,
            count_only: true,
        });
        assert_eq!(counted, serde_json::json!(1));
        assert!(server.process_info(id).is_some());

        let closed = server.inner.local_execute(&ServersQuery::CloseOlderThan {
            account: "acme".into(),
            app_name: "shop".into(),
            process_class: None,
            older_than_ms: future_cutoff,
            hard_kill: true,
            count_only: false,
        });
        assert_eq!(closed, serde_json::json!(1));
        assert!(server.process_info(id).is_none());
    }

    #[test]
    fn test_checkpoint_flush_writes_dirty_state() {
        let store = Arc::new(MemoryStateStore::new());
        let server = ProcessServer::new("alpha", 1, store.clone());
        let id = server.create_process("acme", "shop", "Cart", echo_factory(OperationType::Permanent));
        server.create_process("acme", "shop", "Cart", echo_factory(OperationType::Permanent));

        let handle = ProcessInstance {
            inner: server.inner.instance(id).unwrap(),
        };
        handle.state_map().insert("items", "3");

        // Only the dirty map is written.
        assert_eq!(server.flush_checkpoints(), 1);
        assert_eq!(
            store.load(id).unwrap().get("items").map(String::as_str),
            Some("3")
        );
        assert_eq!(server.flush_checkpoints(), 0);
    }

    #[test]
    fn test_recover_requires_a_snapshot() {
        let store = Arc::new(MemoryStateStore::new());
        let server = ProcessServer::new("alpha", 1, store.clone());
        let id = server.create_process("acme", "shop", "Cart", echo_factory(OperationType::Permanent));
        assert!(server.suspend_process(id, false));

        // Simulate a host restart: fresh server, same store.
        let restarted = ProcessServer::new("alpha", 1, store);
        assert!(restarted.recover_process(
            "acme",
            "shop",
            "Cart",
            id,
            echo_factory(OperationType::Permanent)
        ));
        assert_eq!(
            restarted.process_info(id).unwrap().state,
            LifecycleState::Suspended
        );

        let unknown = ProcessId::new(1, 999, 999);
        assert!(!restarted.recover_process(
            "acme",
            "shop",
            "Cart",
            unknown,
            echo_factory(OperationType::Permanent)
        ));
    }
}
