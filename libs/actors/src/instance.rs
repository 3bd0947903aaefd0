//! Hosted process instances
//!
//! A `ProcessInstance` is the runtime's handle to one hosted process: its
//! input queue, its state map, its broadcast channels and its lifecycle.
//! Delivery follows a scheduled-pump model: pushing onto the queue marks
//! the instance for pumping exactly once, and the pump holds the
//! operation lock while it drains, so an operation only ever sees one
//! `function` call at a time. Everything here is non-blocking; a message
//! to an unknown process comes back as a `ReturnException` rather than
//! an error at the send site.

use crate::channel::BroadcastQueue;
use crate::cluster::ServersQuery;
use crate::message::{json_reply, FunctionError, InputMessage, ReplyPath, ReplyRoute};
use crate::operation::{LifecycleState, OperationFactory, OperationType, ProcessInfo};
use crate::server::ServerInner;
use crate::state::StateMap;
use codec::ProcessMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use types::{ChannelSessionState, ProcessChannel, ProcessId, ProcessUnavailable};

/// Signal verb that asks a process to shut itself down.
pub const KILL_SIGNAL: &str = "kill";

struct QueueInner {
    messages: VecDeque<InputMessage>,
    signals: VecDeque<Vec<String>>,
    /// True while a pump owns delivery for this instance. Set by the
    /// enqueue that transitions the queue from idle, cleared by the pump
    /// under the same lock when it finds both queues empty.
    pumping: bool,
}

pub(crate) struct InstanceInner {
    id: ProcessId,
    server: Weak<ServerInner>,
    factory: OperationFactory,
    kind: OperationType,
    account: String,
    app_name: String,
    process_class: String,
    created_at_ms: u64,
    operation: Mutex<Option<Box<dyn crate::operation::ProcessOperation>>>,
    queue: Mutex<QueueInner>,
    state_map: StateMap,
    channels: Mutex<HashMap<i32, Arc<BroadcastQueue>>>,
    lifecycle: Mutex<LifecycleState>,
    last_access: Mutex<Instant>,
    next_call_id: AtomicI32,
}

impl InstanceInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ProcessId,
        server: Weak<ServerInner>,
        factory: OperationFactory,
        kind: OperationType,
        account: String,
        app_name: String,
        process_class: String,
        state_map: StateMap,
        lifecycle: LifecycleState,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            server,
            factory,
            kind,
            account,
            app_name,
            process_class,
            created_at_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            operation: Mutex::new(None),
            queue: Mutex::new(QueueInner {
                messages: VecDeque::new(),
                signals: VecDeque::new(),
                pumping: false,
            }),
            state_map,
            channels: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(lifecycle),
            last_access: Mutex::new(Instant::now()),
            next_call_id: AtomicI32::new(1),
        })
    }

    pub(crate) fn id(&self) -> ProcessId {
        self.id
    }

    pub(crate) fn kind(&self) -> OperationType {
        self.kind
    }

    pub(crate) fn process_class(&self) -> &str {
        &self.process_class
    }

    pub(crate) fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub(crate) fn matches(&self, account: &str, app_name: &str, class: Option<&str>) -> bool {
        self.account == account
            && self.app_name == app_name
            && class.map_or(true, |class| class == self.process_class)
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    pub(crate) fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.lock()
    }

    pub(crate) fn info(&self) -> ProcessInfo {
        ProcessInfo {
            id: self.id.to_string(),
            account: self.account.clone(),
            app_name: self.app_name.clone(),
            process_class: self.process_class.clone(),
            kind: self.kind,
            state: self.lifecycle(),
            created_at_ms: self.created_at_ms,
        }
    }

    fn next_call_id(&self) -> i32 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Pushes a message and reports whether the caller must start a pump.
    fn push_message(&self, message: InputMessage) -> bool {
        let mut queue = self.queue.lock();
        queue.messages.push_back(message);
        !std::mem::replace(&mut queue.pumping, true)
    }

    fn push_signal(&self, signal: Vec<String>) -> bool {
        let mut queue = self.queue.lock();
        queue.signals.push_back(signal);
        !std::mem::replace(&mut queue.pumping, true)
    }

    /// The per-channel broadcast queue, created on first use.
    pub(crate) fn broadcast_queue(&self, number: i32) -> Arc<BroadcastQueue> {
        self.channels
            .lock()
            .entry(number)
            .or_insert_with(|| {
                Arc::new(BroadcastQueue::new(ProcessChannel::new(self.id, number)))
            })
            .clone()
    }

    pub(crate) fn expire_notifiers(&self, max_age: Duration) {
        let queues: Vec<_> = self.channels.lock().values().cloned().collect();
        for queue in queues {
            queue.expire_notifiers(max_age);
        }
    }

    /// Checkpoints the state map to the host's store if it is dirty and
    /// not locked by a handler. Returns whether a snapshot was written.
    pub(crate) fn flush_checkpoint(&self, wait: Duration) -> bool {
        if !self.kind.is_suspendable() {
            return false;
        }
        let Some(server) = self.server.upgrade() else {
            return false;
        };
        match self.state_map.try_flush(wait) {
            Some(snapshot) => {
                server.store().store(self.id, snapshot);
                true
            }
            None => false,
        }
    }

    /// Evicts the operation from memory after checkpointing its state.
    /// Refused for non-suspendable kinds, busy queues, closed instances
    /// and (unless `force`) operations that report themselves non-dormant.
    pub(crate) fn suspend(&self, force: bool) -> bool {
        if !self.kind.is_suspendable() {
            return false;
        }
        let mut slot = self.operation.lock();
        {
            let queue = self.queue.lock();
            if queue.pumping || !queue.messages.is_empty() || !queue.signals.is_empty() {
                return false;
            }
        }
        {
            let lifecycle = self.lifecycle.lock();
            if !matches!(*lifecycle, LifecycleState::Created | LifecycleState::Active) {
                return false;
            }
        }
        match slot.take() {
            Some(mut operation) => {
                if !force && !operation.is_dormant() {
                    *slot = Some(operation);
                    return false;
                }
                operation.suspend(&self.state_map);
            }
            // Never pumped: nothing in memory to evict, the state map
            // already holds everything the factory rebuild needs.
            None => {}
        }
        if let Some(server) = self.server.upgrade() {
            server.store().store(self.id, self.state_map.snapshot());
        }
        *self.lifecycle.lock() = LifecycleState::Suspended;
        tracing::debug!(process = %self.id, "process suspended");
        true
    }

    /// Closes the process: removes it from the host table, drops its
    /// stored state, fails its channels and discards queued input. Close
    /// always wins; a suspended instance is closed without resuming it.
    pub(crate) fn close(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == LifecycleState::Closed {
                return;
            }
            *lifecycle = LifecycleState::Closed;
        }
        {
            let mut queue = self.queue.lock();
            queue.messages.clear();
            queue.signals.clear();
        }
        let queues: Vec<_> = self.channels.lock().values().cloned().collect();
        for queue in queues {
            queue.close();
        }
        if let Some(server) = self.server.upgrade() {
            server.forget(self.id);
        }
        tracing::debug!(process = %self.id, class = %self.process_class, "process closed");
    }
}

/// Schedules delivery after `inner.push_*` reported an idle queue.
///
/// Inside a tokio runtime the pump runs on the blocking pool so a slow
/// handler cannot stall the reactor; outside one it runs inline, which
/// makes plain synchronous tests deterministic.
pub(crate) fn schedule_pump(inner: &Arc<InstanceInner>) {
    match Handle::try_current() {
        Ok(handle) => {
            let inner = inner.clone();
            handle.spawn_blocking(move || pump(&inner));
        }
        Err(_) => pump(inner),
    }
}

fn pump(inner: &Arc<InstanceInner>) {
    let instance = ProcessInstance {
        inner: inner.clone(),
    };
    loop {
        let mut slot = inner.operation.lock();
        if inner.lifecycle() == LifecycleState::Closed {
            let mut queue = inner.queue.lock();
            queue.messages.clear();
            queue.signals.clear();
            queue.pumping = false;
            return;
        }
        *inner.last_access.lock() = Instant::now();
        if slot.is_none() {
            // Rebuild a suspended (or never-started) operation on demand.
            let mut operation = (inner.factory)();
            *inner.lifecycle.lock() = LifecycleState::Active;
            operation.resume(&instance);
            *slot = Some(operation);
        } else {
            *inner.lifecycle.lock() = LifecycleState::Active;
        }
        if let Some(operation) = slot.as_mut() {
            operation.function(&instance);
        }
        if inner.kind() == OperationType::Static {
            drop(slot);
            inner.close();
            continue;
        }
        drop(slot);
        let mut queue = inner.queue.lock();
        if queue.messages.is_empty() && queue.signals.is_empty() {
            queue.pumping = false;
            return;
        }
        // More input arrived while the operation ran; go around again.
    }
}

/// Delivers `message` to `target`, starting a pump if its queue was idle.
pub(crate) fn deliver(target: &Arc<InstanceInner>, message: InputMessage) {
    if target.push_message(message) {
        schedule_pump(target);
    }
}

pub(crate) fn deliver_signal(target: &Arc<InstanceInner>, signal: Vec<String>) {
    if target.push_signal(signal) {
        schedule_pump(target);
    }
}

/// Handle to one hosted process, passed into its operation on every
/// delivery. Cloning is cheap; all clones address the same process.
#[derive(Clone)]
pub struct ProcessInstance {
    pub(crate) inner: Arc<InstanceInner>,
}

impl ProcessInstance {
    pub fn id(&self) -> ProcessId {
        self.inner.id()
    }

    /// The process's durable key/value state.
    pub fn state_map(&self) -> &StateMap {
        &self.inner.state_map
    }

    /// Pops the next queued input message, or `None` when drained.
    pub fn consume_message(&self) -> Option<InputMessage> {
        self.inner.queue.lock().messages.pop_front()
    }

    /// Pops the next queued signal. Signals jump the message queue: an
    /// operation drains them first so a kill cannot starve behind a
    /// backlog.
    pub fn consume_signal(&self) -> Option<Vec<String>> {
        self.inner.queue.lock().signals.pop_front()
    }

    /// Sends the successful reply for a function invoke. Consuming the
    /// invoke message by value is what guarantees at most one reply.
    pub fn send_reply(&self, invoke: InputMessage, reply: ProcessMessage) {
        let InputMessage::FunctionInvoke { call_id, reply: path, .. } = invoke else {
            tracing::warn!(process = %self.id(), "send_reply on a non-invoke message");
            return;
        };
        route_reply(path, InputMessage::Return { call_id, message: reply });
    }

    /// Sends the failure reply for a function invoke. Unexpected failures
    /// also land in the host's error log.
    pub fn send_failure(&self, invoke: InputMessage, error: FunctionError) {
        let InputMessage::FunctionInvoke { call_id, reply: path, .. } = invoke else {
            tracing::warn!(process = %self.id(), "send_failure on a non-invoke message");
            return;
        };
        if error.should_log() {
            tracing::error!(
                process = %self.id(),
                error_type = %error.error_type,
                message = %error.message,
                "function call failed"
            );
        }
        route_reply(path, InputMessage::ReturnException { call_id, error });
    }

    /// Publishes to one of this process's broadcast channels and fans the
    /// message out to every registered listener process. Returns the
    /// session state of the published message.
    pub fn broadcast_message(&self, channel: i32, message: ProcessMessage) -> ChannelSessionState {
        let queue = self.inner.broadcast_queue(channel);
        let state = queue.publish(message.clone());
        if let Some(server) = self.inner.server.upgrade() {
            for (listener, delivered) in server.listeners_of(queue.channel()) {
                // Skip listeners whose delivery mark already covers this
                // sequence: a concurrent cursor replay got there first.
                if delivered.fetch_max(state.sequence(), Ordering::AcqRel) < state.sequence() {
                    deliver(
                        &listener,
                        InputMessage::Broadcast {
                            message: message.clone(),
                            session_state: state,
                        },
                    );
                }
            }
        }
        state
    }

    /// Starts a function call to another process on the same host.
    /// Returns the call id; the reply arrives later as a `Return` or
    /// `ReturnException` input message carrying it. A missing target is
    /// reported the same way, never synchronously.
    pub fn invoke_function(
        &self,
        target: ProcessId,
        message: ProcessMessage,
        reply_expected: bool,
    ) -> i32 {
        let call_id = self.inner.next_call_id();
        let reply = if reply_expected {
            ReplyPath::queue(Arc::downgrade(&self.inner))
        } else {
            ReplyPath::none()
        };
        let Some(server) = self.inner.server.upgrade() else {
            return call_id;
        };
        match server.instance(target) {
            Some(instance) => deliver(
                &instance,
                InputMessage::FunctionInvoke {
                    message,
                    call_id,
                    reply,
                },
            ),
            None => {
                if reply_expected {
                    deliver(
                        &self.inner,
                        InputMessage::ReturnException {
                            call_id,
                            error: FunctionError::expected(
                                "unavailable",
                                format!("no process {target}"),
                            ),
                        },
                    );
                }
            }
        }
        call_id
    }

    /// Schedules a `TimedCallback` onto this process's own queue after
    /// `delay`. Without a tokio runtime the callback is delivered
    /// immediately.
    pub fn schedule_callback(&self, delay: Duration, message: ProcessMessage) -> i32 {
        let call_id = self.inner.next_call_id();
        let callback = InputMessage::TimedCallback { call_id, message };
        match Handle::try_current() {
            Ok(handle) => {
                let target = self.inner.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    deliver(&target, callback);
                });
            }
            Err(_) => {
                tracing::warn!(
                    process = %self.id(),
                    "no tokio runtime; timed callback delivered immediately"
                );
                deliver(&self.inner, callback);
            }
        }
        call_id
    }

    /// Subscribes this process to a broadcast channel. New messages on
    /// the channel arrive as `Broadcast` input messages.
    pub fn add_channel_listener(&self, channel: ProcessChannel) -> Result<(), ProcessUnavailable> {
        self.listen(channel, None)
    }

    /// Subscribes and replays the retained messages after the cursor, so
    /// a listener resuming from stored session state misses nothing that
    /// is still in the window.
    pub fn add_channel_listener_from(
        &self,
        state: &ChannelSessionState,
    ) -> Result<(), ProcessUnavailable> {
        self.listen(state.channel(), Some(state.sequence()))
    }

    fn listen(
        &self,
        channel: ProcessChannel,
        replay_after: Option<i64>,
    ) -> Result<(), ProcessUnavailable> {
        let server = self
            .inner
            .server
            .upgrade()
            .ok_or_else(|| ProcessUnavailable::unreachable(host_gone()))?;
        let queue = server.resolve_queue(channel)?;
        // Without a replay cursor the subscription starts at the live
        // edge of the channel.
        let start_after = replay_after.unwrap_or_else(|| queue.latest_sequence());
        let delivered = server.add_listener(channel, Arc::downgrade(&self.inner), start_after);
        if replay_after.is_some() {
            for (sequence, message) in queue.entries_after(start_after, usize::MAX) {
                // The delivery mark arbitrates between this replay and a
                // concurrent live fan-out of the same sequence.
                if delivered.fetch_max(sequence, Ordering::AcqRel) < sequence {
                    deliver(
                        &self.inner,
                        InputMessage::Broadcast {
                            message,
                            session_state: channel.session_state(sequence),
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Unsubscribes this process from a broadcast channel.
    pub fn remove_channel_listener(&self, channel: ProcessChannel) {
        if let Some(server) = self.inner.server.upgrade() {
            server.remove_listener(channel, &self.inner);
        }
    }

    /// Starts a cluster-wide admin query. The aggregated JSON answer
    /// arrives later as a `Return` input message carrying the call id.
    pub fn invoke_servers_query(&self, query: ServersQuery) -> i32 {
        let call_id = self.inner.next_call_id();
        let Some(server) = self.inner.server.upgrade() else {
            return call_id;
        };
        match Handle::try_current() {
            Ok(handle) => {
                let target = self.inner.clone();
                handle.spawn(async move {
                    let results = server.cluster_execute(&query).await;
                    deliver(
                        &target,
                        InputMessage::Return {
                            call_id,
                            message: json_reply(&results),
                        },
                    );
                });
            }
            Err(_) => {
                let results = futures::executor::block_on(server.cluster_execute(&query));
                deliver(
                    &self.inner,
                    InputMessage::Return {
                        call_id,
                        message: json_reply(&results),
                    },
                );
            }
        }
        call_id
    }

    /// Closes this process permanently.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for ProcessInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessInstance")
            .field("id", &self.inner.id())
            .field("class", &self.inner.process_class())
            .field("state", &self.inner.lifecycle())
            .finish()
    }
}

fn route_reply(path: ReplyPath, reply: InputMessage) {
    match path.into_route() {
        ReplyRoute::None => {}
        ReplyRoute::Queue { target } => {
            if let Some(target) = target.upgrade() {
                deliver(&target, reply);
            }
        }
        ReplyRoute::Pending(shared) => shared.complete(reply),
    }
}

fn host_gone() -> types::ServiceAddress {
    types::ServiceAddress::new("<host dropped>")
}
