//! In-process publish/subscribe for [`ProgressEvent`]s.
//!
//! Every subscriber owns an unbounded channel drained by its own delivery
//! thread, so a slow or panicking observer never applies backpressure to
//! publishers. Publishing is fire-and-forget.

use hatch_schema::{DependencyKey, ProgressEvent, ProgressPhase};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Receives events on a dedicated delivery thread.
pub trait ProgressObserver: Send {
    fn on_event(&mut self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: FnMut(&ProgressEvent) + Send,
{
    fn on_event(&mut self, event: &ProgressEvent) {
        self(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscriber {
    id: u64,
    tx: Sender<ProgressEvent>,
    worker: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct ProgressBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer. Events are delivered in publish order on a
    /// thread owned by this subscription.
    pub fn subscribe(&self, mut observer: impl ProgressObserver + 'static) -> SubscriptionHandle {
        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        let worker = std::thread::Builder::new()
            .name("hatch-progress".to_owned())
            .spawn(move || {
                for event in rx {
                    observer.on_event(&event);
                }
            });
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("failed to spawn progress delivery thread: {e}");
                None
            }
        };
        self.attach(tx, worker)
    }

    /// Attach a raw channel; the caller drains the receiver itself.
    pub fn subscribe_channel(&self) -> (SubscriptionHandle, Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel();
        (self.attach(tx, None), rx)
    }

    fn attach(&self, tx: Sender<ProgressEvent>, worker: Option<JoinHandle<()>>) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Subscriber { id, tx, worker });
        }
        SubscriptionHandle(id)
    }

    /// Detach a subscriber, waiting for its pending events to be delivered.
    /// Returns `false` if the handle was unknown or already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = match self.subscribers.lock() {
            Ok(mut subs) => subs
                .iter()
                .position(|s| s.id == handle.0)
                .map(|i| subs.remove(i)),
            Err(_) => None,
        };
        match removed {
            Some(sub) => {
                finish(sub);
                true
            }
            None => false,
        }
    }

    /// Detach every subscriber and flush their pending events.
    pub fn close(&self) {
        let drained: Vec<Subscriber> = match self.subscribers.lock() {
            Ok(mut subs) => subs.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for sub in drained {
            finish(sub);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn publish(&self, event: ProgressEvent) {
        let Ok(mut subs) = self.subscribers.lock() else {
            return;
        };
        subs.retain(|s| {
            let delivered = s.tx.send(event.clone()).is_ok();
            if !delivered {
                debug!("dropping disconnected progress subscriber {}", s.id);
            }
            delivered
        });
    }
}

fn finish(sub: Subscriber) {
    let Subscriber { tx, worker, .. } = sub;
    drop(tx);
    if let Some(worker) = worker {
        if worker.join().is_err() {
            debug!("progress observer panicked");
        }
    }
}

/// Monotonic sequence source shared by every emitter of one request.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value, starting at 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Publishes events for a single dependency.
#[derive(Clone)]
pub struct ProgressEmitter {
    key: DependencyKey,
    bus: Arc<ProgressBus>,
    sequence: SequenceCounter,
}

impl ProgressEmitter {
    pub fn new(key: DependencyKey, bus: Arc<ProgressBus>, sequence: SequenceCounter) -> Self {
        Self { key, bus, sequence }
    }

    /// An emitter bound to a private bus with no subscribers.
    pub fn detached(key: DependencyKey) -> Self {
        Self::new(key, Arc::new(ProgressBus::new()), SequenceCounter::new())
    }

    pub fn key(&self) -> &DependencyKey {
        &self.key
    }

    pub fn emit(&self, phase: ProgressPhase, percent: Option<u8>, message: impl Into<String>) {
        self.bus.publish(ProgressEvent {
            dependency_key: self.key.clone(),
            phase,
            percent: percent.map(|p| p.min(100)),
            message: message.into(),
            sequence: self.sequence.next(),
        });
    }
}
