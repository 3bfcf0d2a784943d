//! Thread-safe hand-off from the capture thread to the event loop
//!
//! The speech recognizer calls back on a thread the runtime does not own.
//! Those callbacks only ever touch a bounded crossbeam queue; a single pump
//! task on the event loop drains it.

use crate::messages::FragmentEvent;
use crate::{ColloquyError, Result};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// What to do when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued fragment
    DropOldest,
    /// Wait up to the enqueue timeout, then drop the new fragment
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Maximum queued fragments
    pub capacity: usize,

    pub overflow: OverflowPolicy,

    /// Backpressure limit for [`OverflowPolicy::Block`]
    pub enqueue_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            overflow: OverflowPolicy::DropOldest,
            enqueue_timeout_ms: 50,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

/// Cloneable submit handle for foreign threads
#[derive(Clone)]
pub struct FragmentSubmitter {
    tx: Sender<FragmentEvent>,
    /// Used only to evict under [`OverflowPolicy::DropOldest`]
    evict: Receiver<FragmentEvent>,
    shared: Arc<Shared>,
    overflow: OverflowPolicy,
    enqueue_timeout: Duration,
}

impl FragmentSubmitter {
    /// Enqueue a fragment from any thread
    ///
    /// Never fails because the queue is full; fails only once the bridge is
    /// closed.
    pub fn submit(&self, event: FragmentEvent) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ColloquyError::ChannelError("fragment bridge closed".into()));
        }

        match self.overflow {
            OverflowPolicy::DropOldest => self.submit_drop_oldest(event)?,
            OverflowPolicy::Block => self.submit_blocking(event)?,
        }

        self.shared.notify.notify_one();
        Ok(())
    }

    fn submit_drop_oldest(&self, mut event: FragmentEvent) -> Result<()> {
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    event = back;
                    if let Ok(evicted) = self.evict.try_recv() {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Fragment queue full, dropped oldest fragment from {}",
                            evicted.speaker_id
                        );
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(ColloquyError::ChannelError(
                        "fragment bridge disconnected".into(),
                    ));
                }
            }
        }
    }

    fn submit_blocking(&self, event: FragmentEvent) -> Result<()> {
        match self.tx.send_timeout(event, self.enqueue_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(dropped)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Fragment queue full for {:?}, dropped fragment from {}",
                    self.enqueue_timeout, dropped.speaker_id
                );
                Ok(())
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(ColloquyError::ChannelError(
                "fragment bridge disconnected".into(),
            )),
        }
    }
}

/// Bounded multi-producer, single-consumer fragment queue
pub struct FragmentBridge {
    submitter: FragmentSubmitter,
    rx: Receiver<FragmentEvent>,
    shared: Arc<Shared>,
}

impl FragmentBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (tx, rx) = bounded(config.capacity.max(1));
        let shared = Arc::new(Shared::default());

        let submitter = FragmentSubmitter {
            tx,
            evict: rx.clone(),
            shared: shared.clone(),
            overflow: config.overflow,
            enqueue_timeout: Duration::from_millis(config.enqueue_timeout_ms),
        };

        Self {
            submitter,
            rx,
            shared,
        }
    }

    /// See [`FragmentSubmitter::submit`]
    pub fn submit(&self, event: FragmentEvent) -> Result<()> {
        self.submitter.submit(event)
    }

    /// Handle for the capture thread
    pub fn submitter(&self) -> FragmentSubmitter {
        self.submitter.clone()
    }

    /// Forward every queued fragment in arrival order until the bridge closes
    ///
    /// Only the event-loop pump calls this. It suspends while the queue is
    /// empty and returns once [`close`](Self::close) was called and the
    /// remaining fragments were forwarded.
    pub async fn drain_async<F, Fut>(&self, mut forward: F)
    where
        F: FnMut(FragmentEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            while let Ok(event) = self.rx.try_recv() {
                forward(event).await;
            }

            if self.shared.closed.load(Ordering::Acquire) {
                while let Ok(event) = self.rx.try_recv() {
                    forward(event).await;
                }
                debug!("Fragment bridge closed, pump exiting");
                return;
            }

            self.shared.notify.notified().await;
        }
    }

    /// Stop accepting fragments and let the pump finish
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Fragments currently queued
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Fragments lost to overflow since creation
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
