//! The `Actor` convenience layer
//!
//! Implementing [`ProcessOperation`] by hand means draining queues and
//! matching message kinds yourself. Most processes instead implement
//! [`Actor`]: one method per input kind, reply closures keyed by call id,
//! and per-channel listener callbacks, with [`ActorOperation`] doing the
//! queue mechanics. The dispatch rules encode the delivery contract:
//! signals before messages, one reply per invoke, and a reply closure
//! runs at most once even if a duplicate return slips through.

use crate::cluster::ServersQuery;
use crate::error::ListenerError;
use crate::instance::{ProcessInstance, KILL_SIGNAL};
use crate::message::{FunctionError, InputMessage};
use crate::operation::{OperationFactory, OperationType, ProcessOperation};
use crate::state::StateMap;
use codec::ProcessMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use types::{ChannelSessionState, ProcessChannel, ProcessId};

/// Runs once when the reply to a call arrives. Receives the raw reply
/// message: `Return`, `ReturnException` or `TimedCallback`.
pub type ReplyClosure<A> = Box<dyn FnOnce(&mut A, &mut ActorContext<A>, InputMessage) + Send>;

/// Runs for every broadcast on a subscribed channel.
pub type ChannelListener<A> =
    Box<dyn FnMut(&mut A, &mut ActorContext<A>, &ProcessMessage, &ChannelSessionState) + Send>;

/// A process behavior with per-kind handlers.
pub trait Actor: Send + Sized + 'static {
    fn kind(&self) -> OperationType {
        OperationType::Transient
    }

    /// Whether the dormancy sweep may suspend this actor right now.
    /// Pending reply closures always defer suspension regardless.
    fn is_dormant(&self) -> bool {
        true
    }

    /// Services one function call. `Ok(None)` replies with the empty
    /// message; `Err` travels back to the caller as an exception.
    fn handle_invoke(
        &mut self,
        ctx: &mut ActorContext<Self>,
        message: &ProcessMessage,
    ) -> Result<Option<ProcessMessage>, FunctionError>;

    /// Handles an out-of-band signal. The default honors the kill verb
    /// by closing the process.
    fn handle_signal(&mut self, ctx: &mut ActorContext<Self>, signal: &[String]) {
        if signal.first().map(String::as_str) == Some(KILL_SIGNAL) {
            ctx.close();
        }
    }

    /// Runs before the actor is checkpointed and evicted.
    fn on_suspend(&mut self, state: &StateMap) {
        let _ = state;
    }

    /// Runs after the actor is rebuilt from checkpointed state, before
    /// any queued message is delivered.
    fn on_resume(&mut self, ctx: &mut ActorContext<Self>) {
        let _ = ctx;
    }
}

/// The actor's connection to its runtime: call issuing, subscriptions,
/// state and lifecycle.
pub struct ActorContext<A: Actor> {
    instance: Option<ProcessInstance>,
    closures: HashMap<i32, ReplyClosure<A>>,
    listeners: HashMap<ProcessChannel, ChannelListener<A>>,
}

impl<A: Actor> ActorContext<A> {
    fn new() -> Self {
        Self {
            instance: None,
            closures: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    fn bind(&mut self, instance: &ProcessInstance) {
        self.instance = Some(instance.clone());
    }

    /// The hosting instance. Bound before any handler runs.
    fn instance(&self) -> &ProcessInstance {
        self.instance
            .as_ref()
            .expect("actor context used outside a handler")
    }

    pub fn id(&self) -> ProcessId {
        self.instance().id()
    }

    pub fn state_map(&self) -> &StateMap {
        self.instance().state_map()
    }

    /// Whether any reply closures are still waiting.
    pub fn has_pending_calls(&self) -> bool {
        !self.closures.is_empty()
    }

    /// Calls a function on another process. With a closure the reply is
    /// routed back to it; without one the call is one-way.
    pub fn invoke_function(
        &mut self,
        target: ProcessId,
        message: ProcessMessage,
        on_reply: Option<ReplyClosure<A>>,
    ) -> i32 {
        let call_id = self
            .instance()
            .invoke_function(target, message, on_reply.is_some());
        if let Some(closure) = on_reply {
            self.closures.insert(call_id, closure);
        }
        call_id
    }

    /// Schedules `on_fire` to run with a `TimedCallback` after `delay`.
    pub fn schedule_callback(
        &mut self,
        delay: Duration,
        message: ProcessMessage,
        on_fire: ReplyClosure<A>,
    ) -> i32 {
        let call_id = self.instance().schedule_callback(delay, message);
        self.closures.insert(call_id, on_fire);
        call_id
    }

    /// Starts a cluster admin query; `on_result` receives the aggregated
    /// JSON answer as a `Return` message.
    pub fn invoke_servers_query(&mut self, query: ServersQuery, on_result: ReplyClosure<A>) -> i32 {
        let call_id = self.instance().invoke_servers_query(query);
        self.closures.insert(call_id, on_result);
        call_id
    }

    /// Subscribes `listener` to a broadcast channel. At most one
    /// listener per channel; remove the old one to replace it.
    pub fn set_channel_listener(
        &mut self,
        channel: ProcessChannel,
        listener: ChannelListener<A>,
    ) -> Result<(), ListenerError> {
        if self.listeners.contains_key(&channel) {
            return Err(ListenerError::AlreadySet(channel));
        }
        self.instance().add_channel_listener(channel)?;
        self.listeners.insert(channel, listener);
        Ok(())
    }

    /// Subscribes and replays retained messages newer than the cursor
    /// before live delivery begins.
    pub fn set_channel_listener_from(
        &mut self,
        state: &ChannelSessionState,
        listener: ChannelListener<A>,
    ) -> Result<(), ListenerError> {
        let channel = state.channel();
        if self.listeners.contains_key(&channel) {
            return Err(ListenerError::AlreadySet(channel));
        }
        self.instance().add_channel_listener_from(state)?;
        self.listeners.insert(channel, listener);
        Ok(())
    }

    pub fn remove_channel_listener(&mut self, channel: ProcessChannel) {
        self.listeners.remove(&channel);
        self.instance().remove_channel_listener(channel);
    }

    /// Publishes on one of this process's own channels.
    pub fn broadcast(&self, channel: i32, message: ProcessMessage) -> ChannelSessionState {
        self.instance().broadcast_message(channel, message)
    }

    /// Closes this process permanently.
    pub fn close(&self) {
        self.instance().close();
    }
}

/// Adapter that hosts an [`Actor`] behind the raw operation contract.
pub struct ActorOperation<A: Actor> {
    actor: A,
    ctx: ActorContext<A>,
}

impl<A: Actor> ActorOperation<A> {
    pub fn new(actor: A) -> Self {
        Self {
            actor,
            ctx: ActorContext::new(),
        }
    }

    fn dispatch(&mut self, instance: &ProcessInstance, message: InputMessage) {
        match message {
            msg @ InputMessage::FunctionInvoke { .. } => {
                let payload = msg.message().cloned().unwrap_or_default();
                match self.actor.handle_invoke(&mut self.ctx, &payload) {
                    Ok(reply) => {
                        instance.send_reply(msg, reply.unwrap_or_else(ProcessMessage::empty))
                    }
                    Err(error) => instance.send_failure(msg, error),
                }
            }
            InputMessage::Broadcast {
                message,
                session_state,
            } => {
                let channel = session_state.channel();
                match self.ctx.listeners.remove(&channel) {
                    Some(mut listener) => {
                        listener(&mut self.actor, &mut self.ctx, &message, &session_state);
                        // Put the listener back unless the handler
                        // replaced or removed it.
                        self.ctx.listeners.entry(channel).or_insert(listener);
                    }
                    None => {
                        tracing::debug!(channel = %channel, "broadcast with no listener dropped")
                    }
                }
            }
            msg @ (InputMessage::Return { .. }
            | InputMessage::ReturnException { .. }
            | InputMessage::TimedCallback { .. }) => {
                let call_id = msg.call_id().unwrap_or(-1);
                match self.ctx.closures.remove(&call_id) {
                    Some(closure) => closure(&mut self.actor, &mut self.ctx, msg),
                    // Duplicate or post-eviction reply; the closure
                    // already ran or was never registered.
                    None => tracing::debug!(call_id, "reply with no pending closure dropped"),
                }
            }
        }
    }
}

impl<A: Actor> ProcessOperation for ActorOperation<A> {
    fn kind(&self) -> OperationType {
        self.actor.kind()
    }

    fn is_dormant(&self) -> bool {
        self.actor.is_dormant() && self.ctx.closures.is_empty()
    }

    fn suspend(&mut self, state: &StateMap) {
        self.actor.on_suspend(state);
    }

    fn resume(&mut self, instance: &ProcessInstance) {
        self.ctx.bind(instance);
        self.actor.on_resume(&mut self.ctx);
    }

    fn function(&mut self, instance: &ProcessInstance) {
        self.ctx.bind(instance);
        loop {
            // Signals jump the queue.
            if let Some(signal) = instance.consume_signal() {
                self.actor.handle_signal(&mut self.ctx, &signal);
                continue;
            }
            let Some(message) = instance.consume_message() else {
                return;
            };
            self.dispatch(instance, message);
        }
    }
}

/// Operation factory for an actor type, for process registration.
pub fn actor_factory<A, F>(make: F) -> OperationFactory
where
    A: Actor,
    F: Fn() -> A + Send + Sync + 'static,
{
    Arc::new(move || Box::new(ActorOperation::new(make())) as Box<dyn ProcessOperation>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ProcessServer;
    use codec::{decode_string_args, encode_args, ArgValue};

    struct Shout;

    impl Actor for Shout {
        fn handle_invoke(
            &mut self,
            _ctx: &mut ActorContext<Self>,
            message: &ProcessMessage,
        ) -> Result<Option<ProcessMessage>, FunctionError> {
            let text = decode_string_args(message)
                .ok()
                .and_then(|mut args| args.pop().flatten())
                .ok_or_else(|| FunctionError::expected("badarg", "expected one string"))?;
            Ok(Some(
                encode_args(&[ArgValue::from(text.to_uppercase())]).unwrap(),
            ))
        }
    }

    fn text(s: &str) -> ProcessMessage {
        encode_args(&[ArgValue::from(s)]).unwrap()
    }

    fn read_text(msg: &ProcessMessage) -> String {
        decode_string_args(msg).unwrap().remove(0).unwrap()
    }

    #[test]
    fn test_invoke_reply_round_trip() {
        let server = ProcessServer::in_memory("alpha", 1);
        let id = server.create_process("acme", "shop", "Shout", actor_factory(|| Shout));
        let result = server
            .client()
            .invoke_function(id, text("hello"), true)
            .unwrap()
            .unwrap();
        match result.result().unwrap() {
            InputMessage::Return { message, .. } => assert_eq!(read_text(&message), "HELLO"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_handler_fault_becomes_exception_and_actor_survives() {
        let server = ProcessServer::in_memory("alpha", 1);
        let id = server.create_process("acme", "shop", "Shout", actor_factory(|| Shout));
        let client = server.client();

        // Not a string argument list: the handler refuses it.
        let bad = encode_args(&[ArgValue::I32(5)]).unwrap();
        let failed = client.invoke_function(id, bad, true).unwrap().unwrap();
        match failed.result().unwrap() {
            InputMessage::ReturnException { error, .. } => {
                assert_eq!(error.error_type, "badarg");
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        // The next call on the same process succeeds.
        let ok = client.invoke_function(id, text("still up"), true).unwrap().unwrap();
        match ok.result().unwrap() {
            InputMessage::Return { message, .. } => assert_eq!(read_text(&message), "STILL UP"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_default_signal_handler_honors_kill() {
        let server = ProcessServer::in_memory("alpha", 1);
        let id = server.create_process("acme", "shop", "Shout", actor_factory(|| Shout));
        server.send_signal(id, vec![KILL_SIGNAL.to_string()]);
        assert!(server.process_info(id).is_none());
    }

    #[test]
    fn test_one_way_invoke_returns_no_result() {
        let server = ProcessServer::in_memory("alpha", 1);
        let id = server.create_process("acme", "shop", "Shout", actor_factory(|| Shout));
        assert!(server
            .client()
            .invoke_function(id, text("fire and forget"), false)
            .unwrap()
            .is_none());
    }
}
