//! Broadcast channels
//!
//! A process publishes to numbered channels; each channel is backed by a
//! [`BroadcastQueue`] holding a sliding window of recent messages, each
//! stamped with a monotonic sequence number. Consumers hold a cursor (the
//! last sequence they saw) and replay forward from it, so a consumer that
//! reconnects within the retention window misses nothing. A cursor that
//! has fallen out of the window silently resumes at the oldest retained
//! message; broadcast delivery is best-effort by contract.
//!
//! Consumers that catch up park a [`ResultNotifier`] on the queue instead
//! of polling. Parked notifiers are evicted after
//! [`NOTIFIER_EVICTION_TIMEOUT`] so an abandoned client cannot pin its
//! callback forever.

use crate::notifier::{CleanupHandler, NotifyStatus, ResultNotifier};
use codec::ProcessMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use types::{
    ChannelSessionState, ProcessChannel, ProcessUnavailable, ServiceAddress, UnavailableReason,
};

/// How long a broadcast message stays replayable.
pub const MESSAGE_RETENTION: Duration = Duration::from_secs(120);

/// How long a parked notifier may wait before the eviction sweep fires
/// it with [`NotifyStatus::Timeout`].
pub const NOTIFIER_EVICTION_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Sequence number assigned to the first message on every channel.
/// Values below this are reserved as pre-first cursor positions.
const FIRST_SEQUENCE: i64 = 16;

struct QueueEntry {
    sequence: i64,
    sent_at: Instant,
    message: ProcessMessage,
}

struct RegisteredNotifier {
    token: u64,
    notifier: ResultNotifier,
    registered_at: Instant,
}

struct QueueState {
    entries: VecDeque<QueueEntry>,
    next_sequence: i64,
    notifiers: Vec<RegisteredNotifier>,
    next_token: u64,
    closed: bool,
}

impl QueueState {
    /// Sequence one before the oldest replayable message; the cursor a
    /// fresh consumer starts from.
    fn floor_sequence(&self) -> i64 {
        match self.entries.front() {
            Some(front) => front.sequence - 1,
            None => self.next_sequence - 1,
        }
    }

    fn purge_expired(&mut self, retention: Duration, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.sent_at) >= retention {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_after(&self, after: i64) -> bool {
        self.entries.back().is_some_and(|back| back.sequence > after)
    }
}

/// Retained window of broadcast messages for one channel.
pub struct BroadcastQueue {
    channel: ProcessChannel,
    retention: Duration,
    state: Mutex<QueueState>,
}

impl BroadcastQueue {
    pub fn new(channel: ProcessChannel) -> Self {
        Self::with_retention(channel, MESSAGE_RETENTION)
    }

    /// Queue with a custom retention window, for tests that exercise
    /// expiry without waiting out the real window.
    pub fn with_retention(channel: ProcessChannel, retention: Duration) -> Self {
        Self {
            channel,
            retention,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                next_sequence: FIRST_SEQUENCE,
                notifiers: Vec::new(),
                next_token: 0,
                closed: false,
            }),
        }
    }

    pub fn channel(&self) -> ProcessChannel {
        self.channel
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Appends a message to the window and wakes every parked consumer.
    /// Returns the session state of the published message.
    pub fn publish(&self, message: ProcessMessage) -> ChannelSessionState {
        let (sequence, woken) = {
            let mut state = self.state.lock();
            if state.closed {
                return self.channel.session_state(state.next_sequence - 1);
            }
            state.purge_expired(self.retention, Instant::now());
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.entries.push_back(QueueEntry {
                sequence,
                sent_at: Instant::now(),
                message,
            });
            let woken: Vec<_> = state
                .notifiers
                .drain(..)
                .map(|registered| registered.notifier)
                .collect();
            (sequence, woken)
        };
        // Notify outside the lock: callbacks may consume immediately.
        for notifier in woken {
            notifier.notify(NotifyStatus::MessagesWaiting);
        }
        self.channel.session_state(sequence)
    }

    /// Sequence of the most recently published message, or the pre-first
    /// cursor when nothing was ever published.
    pub(crate) fn latest_sequence(&self) -> i64 {
        self.state.lock().next_sequence - 1
    }

    /// Retained messages with sequence above `after`, oldest first, each
    /// paired with its sequence. A stale `after` is clamped forward to
    /// the edge of the window.
    pub(crate) fn entries_after(&self, after: i64, limit: usize) -> Vec<(i64, ProcessMessage)> {
        let mut state = self.state.lock();
        state.purge_expired(self.retention, Instant::now());
        let cursor = after.max(state.floor_sequence());
        state
            .entries
            .iter()
            .filter(|entry| entry.sequence > cursor)
            .take(limit)
            .map(|entry| (entry.sequence, entry.message.clone()))
            .collect()
    }

    /// Replays up to `limit` retained messages with sequence above
    /// `after`. Returns the advanced cursor alongside the messages.
    fn consume_after(&self, after: i64, limit: usize) -> (i64, Vec<ProcessMessage>) {
        let entries = self.entries_after(after, limit);
        let cursor = entries.last().map_or_else(
            || after.max(self.state.lock().floor_sequence()),
            |(sequence, _)| *sequence,
        );
        (cursor, entries.into_iter().map(|(_, message)| message).collect())
    }

    /// Parks `notifier` to fire when a message above `after` arrives.
    /// Returns `false` without parking when such a message is already
    /// retained; the caller should consume instead.
    fn register_notifier(
        self: &Arc<Self>,
        after: i64,
        notifier: &ResultNotifier,
    ) -> Result<bool, ProcessUnavailable> {
        let token = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(closed_error(self.channel));
            }
            if state.has_after(after) {
                return Ok(false);
            }
            let token = state.next_token;
            state.next_token += 1;
            state.notifiers.push(RegisteredNotifier {
                token,
                notifier: notifier.clone(),
                registered_at: Instant::now(),
            });
            token
        };
        // Arming happens outside the queue lock; a publish that drains
        // the registration in the gap completes the notifier first and
        // init then discards the cleanup, so nothing fires twice.
        notifier.init(Arc::new(QueueCleanup {
            queue: Arc::downgrade(self),
            token,
        }));
        Ok(true)
    }

    fn remove_notifier(&self, token: u64) {
        let mut state = self.state.lock();
        state.notifiers.retain(|registered| registered.token != token);
    }

    /// Evicts notifiers parked longer than `max_age`, firing each with
    /// [`NotifyStatus::Timeout`].
    pub fn expire_notifiers(&self, max_age: Duration) {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            state.notifiers.retain(|registered| {
                if now.duration_since(registered.registered_at) >= max_age {
                    expired.push(registered.notifier.clone());
                    false
                } else {
                    true
                }
            });
            expired
        };
        for notifier in expired {
            notifier.notify(NotifyStatus::Timeout);
        }
    }

    /// Shuts the queue: drops retained messages, fails future consumes
    /// and fires every parked notifier with [`NotifyStatus::IoError`].
    pub fn close(&self) {
        let parked: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.entries.clear();
            state.notifiers.drain(..).map(|r| r.notifier).collect()
        };
        for notifier in parked {
            notifier.notify(NotifyStatus::IoError);
        }
    }
}

impl std::fmt::Debug for BroadcastQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BroadcastQueue")
            .field("channel", &self.channel)
            .field("retained", &state.entries.len())
            .field("next_sequence", &state.next_sequence)
            .field("parked", &state.notifiers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

struct QueueCleanup {
    queue: Weak<BroadcastQueue>,
    token: u64,
}

impl CleanupHandler for QueueCleanup {
    fn detach(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.remove_notifier(self.token);
        }
    }
}

fn closed_error(channel: ProcessChannel) -> ProcessUnavailable {
    ProcessUnavailable::new(
        UnavailableReason::Unavailable,
        ServiceAddress::new(channel.to_string()),
        "broadcast channel is closed",
    )
}

/// A consumer's resumable position on one broadcast channel.
pub struct ChannelConsumer {
    queue: Arc<BroadcastQueue>,
    sequence: i64,
}

impl ChannelConsumer {
    /// Consumer starting just before the oldest retained message, so the
    /// first consume replays the full window.
    pub fn new(queue: Arc<BroadcastQueue>) -> Self {
        let sequence = queue.state.lock().floor_sequence();
        Self { queue, sequence }
    }

    /// Consumer resuming from an explicit cursor.
    pub fn at(queue: Arc<BroadcastQueue>, sequence: i64) -> Self {
        Self { queue, sequence }
    }

    /// Consumer resuming from a serialized session state.
    pub fn from_state(queue: Arc<BroadcastQueue>, state: &ChannelSessionState) -> Self {
        debug_assert_eq!(state.channel(), queue.channel());
        Self::at(queue, state.sequence())
    }

    pub fn channel(&self) -> ProcessChannel {
        self.queue.channel()
    }

    /// The cursor to persist; feeding it back into
    /// [`ChannelConsumer::from_state`] resumes exactly here.
    pub fn session_state(&self) -> ChannelSessionState {
        self.queue.channel().session_state(self.sequence)
    }

    /// Consumes the next message, or `None` when caught up.
    pub fn consume(&mut self) -> Result<Option<ProcessMessage>, ProcessUnavailable> {
        Ok(self.consume_from_channel(1)?.pop())
    }

    /// Consumes up to `limit` messages past the cursor.
    pub fn consume_from_channel(
        &mut self,
        limit: usize,
    ) -> Result<Vec<ProcessMessage>, ProcessUnavailable> {
        if self.queue.is_closed() {
            return Err(closed_error(self.queue.channel()));
        }
        let (cursor, messages) = self.queue.consume_after(self.sequence, limit);
        self.sequence = cursor;
        Ok(messages)
    }

    /// Consumes up to `limit` messages; when caught up, parks `notifier`
    /// to fire on the next publish instead of returning nothing twice.
    /// The returned batch is empty exactly when the notifier was parked.
    pub fn consume_from_channel_or_notify(
        &mut self,
        limit: usize,
        notifier: &ResultNotifier,
    ) -> Result<Vec<ProcessMessage>, ProcessUnavailable> {
        loop {
            let messages = self.consume_from_channel(limit)?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            if self.queue.register_notifier(self.sequence, notifier)? {
                return Ok(Vec::new());
            }
            // A publish slipped in between the consume and the park;
            // loop to pick it up.
        }
    }
}

impl std::fmt::Debug for ChannelConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConsumer")
            .field("channel", &self.queue.channel())
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{decode_string_args, encode_args, ArgValue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use types::ProcessId;

    fn channel() -> ProcessChannel {
        ProcessChannel::new(ProcessId::new(0x2b, 77, 1001), 0)
    }

    fn text(s: &str) -> ProcessMessage {
        encode_args(&[ArgValue::from(s)]).unwrap()
    }

    fn read_text(msg: &ProcessMessage) -> String {
        decode_string_args(msg).unwrap().remove(0).unwrap()
    }

    #[test]
    fn test_sequences_start_at_sixteen_and_ascend() {
        let queue = BroadcastQueue::new(channel());
        assert_eq!(queue.publish(text("a")).sequence(), 16);
        assert_eq!(queue.publish(text("b")).sequence(), 17);
        assert_eq!(queue.publish(text("c")).sequence(), 18);
    }

    #[test]
    fn test_fresh_consumer_replays_full_window() {
        let queue = Arc::new(BroadcastQueue::new(channel()));
        queue.publish(text("a"));
        queue.publish(text("b"));
        let mut consumer = ChannelConsumer::new(queue);
        let batch = consumer.consume_from_channel(16).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(read_text(&batch[0]), "a");
        assert_eq!(read_text(&batch[1]), "b");
        assert!(consumer.consume().unwrap().is_none());
    }

    #[test]
    fn test_session_state_resumes_where_it_left_off() {
        let queue = Arc::new(BroadcastQueue::new(channel()));
        queue.publish(text("a"));
        let mut first = ChannelConsumer::new(queue.clone());
        first.consume().unwrap();
        let state = first.session_state();
        drop(first);

        queue.publish(text("b"));
        let mut resumed = ChannelConsumer::from_state(queue, &state);
        assert_eq!(read_text(&resumed.consume().unwrap().unwrap()), "b");
        assert!(resumed.consume().unwrap().is_none());
    }

    #[test]
    fn test_stale_cursor_resumes_at_oldest_retained() {
        let queue = Arc::new(BroadcastQueue::with_retention(
            channel(),
            Duration::from_millis(30),
        ));
        queue.publish(text("old"));
        std::thread::sleep(Duration::from_millis(40));
        queue.publish(text("new"));

        // Cursor far behind the window; no error, delivery restarts at
        // the oldest message still retained.
        let mut consumer = ChannelConsumer::at(queue, 0);
        let batch = consumer.consume_from_channel(16).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(read_text(&batch[0]), "new");
    }

    #[test]
    fn test_expired_messages_are_not_replayed() {
        let queue = Arc::new(BroadcastQueue::with_retention(
            channel(),
            Duration::from_millis(20),
        ));
        queue.publish(text("gone"));
        std::thread::sleep(Duration::from_millis(30));
        let mut consumer = ChannelConsumer::new(queue);
        assert!(consumer.consume().unwrap().is_none());
    }

    #[test]
    fn test_notifier_parks_then_fires_on_publish() {
        let queue = Arc::new(BroadcastQueue::new(channel()));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let notifier = ResultNotifier::new(move |status| {
            assert_eq!(status, NotifyStatus::MessagesWaiting);
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let mut consumer = ChannelConsumer::new(queue.clone());
        let batch = consumer
            .consume_from_channel_or_notify(16, &notifier)
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        queue.publish(text("wake"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(read_text(&consumer.consume().unwrap().unwrap()), "wake");

        // The registration was single-shot.
        queue.publish(text("again"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_notify_skipped_when_data_waiting() {
        let queue = Arc::new(BroadcastQueue::new(channel()));
        queue.publish(text("ready"));
        let notifier = ResultNotifier::new(|_| panic!("must not park"));
        let mut consumer = ChannelConsumer::new(queue);
        let batch = consumer
            .consume_from_channel_or_notify(16, &notifier)
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_eviction_fires_timeout() {
        let queue = Arc::new(BroadcastQueue::new(channel()));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let notifier = ResultNotifier::new(move |status| {
            assert_eq!(status, NotifyStatus::Timeout);
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let mut consumer = ChannelConsumer::new(queue.clone());
        consumer
            .consume_from_channel_or_notify(16, &notifier)
            .unwrap();

        queue.expire_notifiers(Duration::ZERO);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Evicted registration must not fire again on publish.
        queue.publish(text("late"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_fails_consumers_and_fires_io_error() {
        let queue = Arc::new(BroadcastQueue::new(channel()));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let notifier = ResultNotifier::new(move |status| {
            assert_eq!(status, NotifyStatus::IoError);
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        let mut consumer = ChannelConsumer::new(queue.clone());
        consumer
            .consume_from_channel_or_notify(16, &notifier)
            .unwrap();

        queue.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(consumer.consume().is_err());
    }

    #[test]
    fn test_limit_caps_the_batch() {
        let queue = Arc::new(BroadcastQueue::new(channel()));
        for i in 0..5 {
            queue.publish(text(&i.to_string()));
        }
        let mut consumer = ChannelConsumer::new(queue);
        assert_eq!(consumer.consume_from_channel(2).unwrap().len(), 2);
        assert_eq!(consumer.consume_from_channel(2).unwrap().len(), 2);
        assert_eq!(consumer.consume_from_channel(2).unwrap().len(), 1);
    }
}
