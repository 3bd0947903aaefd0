//! Strand Actor Runtime
//!
//! Process hosting infrastructure for Strand: every unit of computation is
//! a "process" addressed by a `ProcessId`, draining a queue of input
//! messages one at a time. Clients talk to processes through asynchronous
//! function calls correlated by call id, and processes publish to numbered
//! broadcast channels that clients consume through resumable cursors.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐      ┌───────────────────────┐
//! │    ProcessServer     │      │     Client Tier       │
//! │                      │      │                       │
//! │  ┌────────────────┐  │      │ ┌───────────────────┐ │
//! │  │ ProcessInstance│──┼──────┼─│ ServiceClient     │ │
//! │  │ queue + state  │  │invoke│ │ ProcessResult     │ │
//! │  └───────┬────────┘  │reply │ └───────────────────┘ │
//! │          │broadcast  │      │ ┌───────────────────┐ │
//! │  ┌───────▼────────┐  │      │ │ ChannelConsumer   │ │
//! │  │ BroadcastQueue │──┼──────┼─│ (session cursor)  │ │
//! │  └────────────────┘  │      │ └───────────────────┘ │
//! └──────────────────────┘      └───────────────────────┘
//! ```
//!
//! Nothing in this crate blocks a caller thread (the single exception is
//! the explicit `ProcessResult::block_until_result` convenience). Every
//! potentially-slow operation returns immediately, optionally registering
//! a `ResultNotifier` continuation that fires at most once.

pub mod channel;
pub mod client;
pub mod cluster;
pub mod convenience;
pub mod error;
pub mod instance;
pub mod message;
pub mod notifier;
pub mod operation;
pub mod server;
pub mod state;

pub use channel::{BroadcastQueue, ChannelConsumer, MESSAGE_RETENTION, NOTIFIER_EVICTION_TIMEOUT};
pub use client::{ProcessResult, ServiceClient, DEFAULT_DISPATCH_TIMEOUT};
pub use cluster::{Cluster, QueryEndpoint, QueryOutcome, QueryParseError, ServersQuery};
pub use convenience::{
    actor_factory, Actor, ActorContext, ActorOperation, ChannelListener, ReplyClosure,
};
pub use error::{ListenerError, ResultTimeout};
pub use instance::{ProcessInstance, KILL_SIGNAL};
pub use message::{FunctionError, InputMessage, ReplyPath};
pub use notifier::{CleanupHandler, NotifyStatus, ResultNotifier};
pub use operation::{
    LifecycleState, OperationFactory, OperationType, ProcessInfo, ProcessOperation,
};
pub use server::ProcessServer;
pub use state::{MemoryStateStore, StateMap, StateStore, FLUSH_LOCK_WAIT};
