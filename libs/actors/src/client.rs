//! Client tier
//!
//! `ServiceClient` is the entry point for callers that live outside any
//! hosted process: web request handlers, schedulers, admin tools. A
//! function call returns a [`ProcessResult`] immediately; the caller
//! either polls it, parks a [`ResultNotifier`] on it, or (in the rare
//! blocking contexts) waits on it with a bounded timeout.

use crate::channel::ChannelConsumer;
use crate::cluster::ServersQuery;
use crate::error::ResultTimeout;
use crate::instance::deliver;
use crate::message::{json_reply, InputMessage, ReplyPath};
use crate::notifier::{CleanupHandler, NotifyStatus, ResultNotifier};
use crate::server::ServerInner;
use codec::ProcessMessage;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use types::{ChannelSessionState, ProcessChannel, ProcessId, ProcessUnavailable};

/// How long a pending result waits before a parked notifier is fired
/// with [`NotifyStatus::Timeout`].
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(180);

struct PendingState {
    outcome: Option<InputMessage>,
    notifier: Option<ResultNotifier>,
}

/// Shared slot a reply lands in. Held by the caller through
/// [`ProcessResult`] and by the callee's reply path.
pub(crate) struct PendingShared {
    call_id: i32,
    state: Mutex<PendingState>,
    cond: Condvar,
}

impl PendingShared {
    pub(crate) fn new(call_id: i32) -> Arc<Self> {
        Arc::new(Self {
            call_id,
            state: Mutex::new(PendingState {
                outcome: None,
                notifier: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn call_id(&self) -> i32 {
        self.call_id
    }

    /// Lands the reply. A second reply for the same call is dropped.
    pub(crate) fn complete(&self, outcome: InputMessage) {
        let notifier = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                tracing::warn!(call_id = self.call_id, "duplicate reply dropped");
                return;
            }
            state.outcome = Some(outcome);
            self.cond.notify_all();
            state.notifier.take()
        };
        if let Some(notifier) = notifier {
            notifier.notify(NotifyStatus::MessagesWaiting);
        }
    }
}

struct PendingCleanup {
    shared: Weak<PendingShared>,
}

impl CleanupHandler for PendingCleanup {
    fn detach(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.state.lock().notifier = None;
        }
    }
}

/// Handle to the eventual outcome of one function call.
///
/// The outcome arrives as the same [`InputMessage`] shape a process
/// would see: `Return` on success, `ReturnException` on failure.
pub struct ProcessResult {
    shared: Arc<PendingShared>,
}

impl ProcessResult {
    pub(crate) fn new(shared: Arc<PendingShared>) -> Self {
        Self { shared }
    }

    pub fn call_id(&self) -> i32 {
        self.shared.call_id
    }

    /// Takes the outcome if it has arrived.
    pub fn result(&self) -> Option<InputMessage> {
        self.shared.state.lock().outcome.take()
    }

    /// Takes the outcome, or parks `notifier` to fire when it arrives.
    /// Exactly one of the two happens: a `Some` return means the
    /// notifier was not retained. A parked notifier is fired with
    /// [`NotifyStatus::Timeout`] after [`DEFAULT_DISPATCH_TIMEOUT`].
    pub fn result_or_notify(&self, notifier: &ResultNotifier) -> Option<InputMessage> {
        {
            let mut state = self.shared.state.lock();
            if let Some(outcome) = state.outcome.take() {
                return Some(outcome);
            }
            state.notifier = Some(notifier.clone());
        }
        notifier.init(Arc::new(PendingCleanup {
            shared: Arc::downgrade(&self.shared),
        }));
        if let Ok(handle) = Handle::try_current() {
            let timer = notifier.clone();
            handle.spawn(async move {
                tokio::time::sleep(DEFAULT_DISPATCH_TIMEOUT).await;
                timer.notify(NotifyStatus::Timeout);
            });
        }
        None
    }

    /// Blocks the calling thread until the outcome arrives. Only for
    /// contexts with no better continuation; never call this from a
    /// process operation.
    pub fn block_until_result(&self, timeout: Duration) -> Result<InputMessage, ResultTimeout> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                return Ok(outcome);
            }
            let now = Instant::now();
            if now >= deadline
                || self
                    .shared
                    .cond
                    .wait_for(&mut state, deadline - now)
                    .timed_out()
            {
                if let Some(outcome) = state.outcome.take() {
                    return Ok(outcome);
                }
                return Err(ResultTimeout { waited: timeout });
            }
        }
    }
}

impl std::fmt::Debug for ProcessResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ProcessResult")
            .field("call_id", &self.shared.call_id)
            .field("ready", &state.outcome.is_some())
            .finish()
    }
}

/// Client handle onto one process server.
#[derive(Clone)]
pub struct ServiceClient {
    server: Arc<ServerInner>,
}

impl ServiceClient {
    pub(crate) fn new(server: Arc<ServerInner>) -> Self {
        Self { server }
    }

    /// Calls a function on a hosted process. Returns `Ok(None)` for
    /// one-way calls, `Ok(Some(result))` when a reply is expected, and
    /// `Err` only when the target process is not hosted here.
    pub fn invoke_function(
        &self,
        target: ProcessId,
        message: ProcessMessage,
        reply_expected: bool,
    ) -> Result<Option<ProcessResult>, ProcessUnavailable> {
        let instance = self.server.instance(target).ok_or_else(|| {
            ProcessUnavailable::new(
                types::UnavailableReason::Unavailable,
                self.server.address().clone(),
                format!("no process {target}"),
            )
        })?;
        let call_id = self.server.next_client_call_id();
        let (reply, result) = if reply_expected {
            let shared = PendingShared::new(call_id);
            (
                ReplyPath::pending(shared.clone()),
                Some(ProcessResult::new(shared)),
            )
        } else {
            (ReplyPath::none(), None)
        };
        deliver(
            &instance,
            InputMessage::FunctionInvoke {
                message,
                call_id,
                reply,
            },
        );
        Ok(result)
    }

    /// Consumer over a broadcast channel, starting at the oldest
    /// retained message.
    pub fn channel_consumer(
        &self,
        channel: ProcessChannel,
    ) -> Result<ChannelConsumer, ProcessUnavailable> {
        Ok(ChannelConsumer::new(self.server.resolve_queue(channel)?))
    }

    /// Consumer resuming from an explicit sequence cursor.
    pub fn channel_consumer_at(
        &self,
        channel: ProcessChannel,
        sequence: i64,
    ) -> Result<ChannelConsumer, ProcessUnavailable> {
        Ok(ChannelConsumer::at(
            self.server.resolve_queue(channel)?,
            sequence,
        ))
    }

    /// Consumer resuming from serialized session state, e.g. out of a
    /// cookie or an external store.
    pub fn channel_consumer_from(
        &self,
        state: &ChannelSessionState,
    ) -> Result<ChannelConsumer, ProcessUnavailable> {
        Ok(ChannelConsumer::from_state(
            self.server.resolve_queue(state.channel())?,
            state,
        ))
    }

    /// Scatter-gathers an admin query across the joined cluster. The
    /// aggregated JSON answer arrives as a `Return` outcome.
    pub fn servers_query(&self, query: ServersQuery) -> ProcessResult {
        let call_id = self.server.next_client_call_id();
        let shared = PendingShared::new(call_id);
        let result = ProcessResult::new(shared.clone());
        let server = self.server.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let results = server.cluster_execute(&query).await;
                    shared.complete(InputMessage::Return {
                        call_id,
                        message: json_reply(&results),
                    });
                });
            }
            Err(_) => {
                let results = futures::executor::block_on(server.cluster_execute(&query));
                shared.complete(InputMessage::Return {
                    call_id,
                    message: json_reply(&results),
                });
            }
        }
        result
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("server", &self.server.address())
            .finish()
    }
}
