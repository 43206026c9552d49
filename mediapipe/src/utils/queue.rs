//! Bounded single-producer/single-consumer queue.
//!
//! The only concurrency primitive shared between stages. A queue is created as a
//! [`Producer`]/[`Consumer`] pair; each half is owned by exactly one stage and
//! neither half is `Clone`. Cancellation goes through [`Closer`], which any
//! number of controllers may hold.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Behaviour of [`Producer::push`] when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// The producer waits for space.
    #[default]
    Block,
    /// The oldest queued item is discarded to make room, provided the
    /// consumer's eviction filter allows it. Otherwise the producer waits.
    DropOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub policy: QueuePolicy,
}

impl QueueConfig {
    pub const fn blocking(capacity: usize) -> Self {
        Self {
            capacity,
            policy: QueuePolicy::Block,
        }
    }

    pub const fn drop_oldest(capacity: usize) -> Self {
        Self {
            capacity,
            policy: QueuePolicy::DropOldest,
        }
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Accepted,
    /// The item was queued after evicting the oldest one.
    Dropped,
    /// The queue was closed or the consumer is gone; the item was discarded.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue closed")
    }
}

impl std::error::Error for QueueClosed {}

#[derive(Debug, PartialEq, Eq)]
pub enum TryPop<T> {
    Item(T),
    Empty,
    Closed,
}

/// Decides whether the item at the head of a full drop-oldest queue may go.
pub type EvictionFilter<T> = Box<dyn Fn(&T) -> bool + Send>;

/// How often a producer held back by the eviction filter re-checks the head.
const EVICTION_RECHECK: Duration = Duration::from_millis(5);

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    producer_gone: bool,
    consumer_gone: bool,
    dropped: u64,
    evictable: Option<EvictionFilter<T>>,
}

impl<T> State<T> {
    fn head_evictable(&self) -> bool {
        match (&self.evictable, self.items.front()) {
            (Some(filter), Some(head)) => filter(head),
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: QueuePolicy,
}

impl<T> Shared<T> {
    fn close_all(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Creates a queue with the given capacity (at least 1) and full-queue policy.
pub fn bounded<T>(config: QueueConfig) -> (Producer<T>, Consumer<T>) {
    let capacity = config.capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            items: VecDeque::with_capacity(capacity),
            closed: false,
            producer_gone: false,
            consumer_gone: false,
            dropped: 0,
            evictable: None,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
        capacity,
        policy: config.policy,
    });

    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Producer<T> {
    /// Enqueues `item`, waiting for space under [`QueuePolicy::Block`] or
    /// while a drop-oldest head is protected by the eviction filter.
    pub fn push(&self, item: T) -> Push {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        loop {
            if state.closed || state.consumer_gone {
                return Push::Closed;
            }
            if state.items.len() < shared.capacity {
                state.items.push_back(item);
                drop(state);
                shared.not_empty.notify_one();
                return Push::Accepted;
            }
            match shared.policy {
                QueuePolicy::Block => shared.not_full.wait(&mut state),
                QueuePolicy::DropOldest if !state.head_evictable() => {
                    shared.not_full.wait_for(&mut state, EVICTION_RECHECK);
                }
                QueuePolicy::DropOldest => {
                    state.items.pop_front();
                    state.dropped += 1;
                    state.items.push_back(item);
                    drop(state);
                    shared.not_empty.notify_one();
                    return Push::Dropped;
                }
            }
        }
    }

    pub fn closer(&self) -> Closer {
        Closer::new(self.shared.clone())
    }

    pub fn is_closed(&self) -> bool {
        let state = self.shared.state.lock();
        state.closed || state.consumer_gone
    }

    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.shared.state.lock().producer_gone = true;
        self.shared.not_empty.notify_all();
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("capacity", &self.shared.capacity)
            .field("policy", &self.shared.policy)
            .finish()
    }
}

pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Consumer<T> {
    /// Waits for the next item. After close, remaining items are still
    /// delivered; `QueueClosed` is returned only once the queue is empty.
    pub fn pop(&self) -> Result<T, QueueClosed> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                shared.not_full.notify_one();
                return Ok(item);
            }
            if state.closed || state.producer_gone {
                return Err(QueueClosed);
            }
            shared.not_empty.wait(&mut state);
        }
    }

    pub fn try_pop(&self) -> TryPop<T> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        match state.items.pop_front() {
            Some(item) => {
                drop(state);
                shared.not_full.notify_one();
                TryPop::Item(item)
            }
            None if state.closed || state.producer_gone => TryPop::Closed,
            None => TryPop::Empty,
        }
    }

    /// Sleeps until `deadline` unless the queue is closed first.
    ///
    /// Returns `true` if the queue was closed. Pushes and the producer going
    /// away do not end the wait.
    pub fn wait_cancelled(&self, deadline: Instant) -> bool {
        let shared = &*self.shared;
        let mut state = shared.state.lock();

        loop {
            if state.closed {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            shared.not_empty.wait_until(&mut state, deadline);
        }
    }

    pub fn closer(&self) -> Closer {
        Closer::new(self.shared.clone())
    }

    /// Restricts drop-oldest eviction to head items `filter` accepts. A
    /// producer facing a full queue and a protected head waits instead.
    pub fn set_eviction_filter(&self, filter: impl Fn(&T) -> bool + Send + 'static) {
        self.shared.state.lock().evictable = Some(Box::new(filter));
        self.shared.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().dropped
    }
}

impl<T> Drop for Consumer<T> {
    fn drop(&mut self) {
        self.shared.state.lock().consumer_gone = true;
        self.shared.not_full.notify_all();
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("capacity", &self.shared.capacity)
            .field("policy", &self.shared.policy)
            .finish()
    }
}

trait Close: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<T: Send> Close for Shared<T> {
    fn close(&self) {
        self.close_all()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Type-erased close handle. Closing is idempotent and wakes every waiter.
#[derive(Clone)]
pub struct Closer {
    target: Arc<dyn Close>,
}

impl Closer {
    fn new<T: Send + 'static>(shared: Arc<Shared<T>>) -> Self {
        Self { target: shared }
    }

    pub fn close(&self) {
        self.target.close();
    }

    pub fn is_closed(&self) -> bool {
        self.target.is_closed()
    }
}

impl fmt::Debug for Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer")
            .field("closed", &self.is_closed())
            .finish()
    }
}
