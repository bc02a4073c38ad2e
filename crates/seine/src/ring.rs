//! Bounded in-memory log buffer with live fan-out.
//!
//! The ring owns the most recent N records (newest at the head) and
//! broadcasts every push to subscribers. Each subscriber gets its own
//! bounded queue; a full queue drops the record for that subscriber only,
//! so a slow consumer can never stall the capture path.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::record::LogRecord;

/// Default ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 2000;
/// Outbound queue length per subscriber.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Shared bounded ring of recent [`LogRecord`]s.
#[derive(Clone)]
pub struct LogRing {
  inner: Arc<Mutex<RingInner>>,
}

struct RingInner {
  buf: VecDeque<LogRecord>,
  capacity: usize,
  subscribers: HashMap<u64, mpsc::Sender<LogRecord>>,
  next_subscriber: u64,
}

/// A live subscription handle. Dropping the handle (and its receiver)
/// detaches the subscriber; the ring prunes it on the next push.
pub struct Subscription {
  id: u64,
  /// Channel of records pushed after the subscription was created.
  pub rx: mpsc::Receiver<LogRecord>,
}

impl Subscription {
  /// The subscriber id, usable with [`LogRing::unsubscribe`].
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Give up the handle and keep only the record stream.
  pub fn into_receiver(self) -> mpsc::Receiver<LogRecord> {
    self.rx
  }
}

impl Default for LogRing {
  fn default() -> Self {
    Self::new(DEFAULT_RING_CAPACITY)
  }
}

impl LogRing {
  pub fn new(capacity: usize) -> LogRing {
    LogRing {
      inner: Arc::new(Mutex::new(RingInner {
        buf: VecDeque::new(),
        capacity: capacity.max(1),
        subscribers: HashMap::new(),
        next_subscriber: 0,
      })),
    }
  }

  /// Insert a record at the head, truncate the tail beyond capacity, and
  /// fan the record out to every live subscriber.
  pub fn push(&self, record: LogRecord) {
    let mut inner = self.inner.lock().expect("ring lock");
    inner.buf.push_front(record.clone());
    let capacity = inner.capacity;
    inner.buf.truncate(capacity);
    // Slow consumers lose this record; closed consumers are removed.
    inner.subscribers.retain(|_, tx| {
      match tx.try_send(record.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
      }
    });
  }

  /// Newest-first shallow copy of up to `limit` records.
  pub fn snapshot(&self, limit: usize) -> Vec<LogRecord> {
    let inner = self.inner.lock().expect("ring lock");
    inner.buf.iter().take(limit).cloned().collect()
  }

  /// Drop all buffered records. Subscriptions are unaffected.
  pub fn clear(&self) {
    self.inner.lock().expect("ring lock").buf.clear();
  }

  pub fn len(&self) -> usize {
    self.inner.lock().expect("ring lock").buf.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Register a live listener for subsequent pushes.
  pub fn subscribe(&self) -> Subscription {
    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
    let mut inner = self.inner.lock().expect("ring lock");
    let id = inner.next_subscriber;
    inner.next_subscriber += 1;
    inner.subscribers.insert(id, tx);
    Subscription { id, rx }
  }

  /// Remove a subscriber eagerly.
  pub fn unsubscribe(&self, id: u64) {
    self.inner.lock().expect("ring lock").subscribers.remove(&id);
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.lock().expect("ring lock").subscribers.len()
  }
}
