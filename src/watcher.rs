//! Watcher fan-out (§4.8): forwards a flat [`KernelStats`] snapshot — no VMO
//! detail — to every registered observer on each short-period KMEM-only
//! capture. Re-architected per the spec's redesign note: the registry owns
//! its handles outright instead of the C++ original's raw back-pointer from
//! watcher to registry, and a dead handle is discovered and dropped the next
//! time a send fails rather than requiring an explicit unregister call.

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::capture::KernelStats;

/// A registered observer's receiving half. Dropping this (or letting the
/// task reading from it exit) is the only way to unregister — there is no
/// separate unregister call, matching the fan-out's ownership model.
pub struct WatcherHandle {
    receiver: Receiver<KernelStats>,
}

impl WatcherHandle {
    pub async fn recv(&mut self) -> Option<KernelStats> {
        self.receiver.recv().await
    }
}

/// Owns the list of subscribed senders. Holds no reference back to any
/// subscriber; a subscriber that has gone away is discovered lazily the next
/// time [`Watchers::notify_all`] tries to send to it.
#[derive(Default)]
pub struct Watchers {
    senders: Vec<Sender<KernelStats>>,
}

impl Watchers {
    #[must_use]
    pub fn new() -> Self {
        Self { senders: Vec::new() }
    }

    /// Registers a new observer with a bounded mailbox of `capacity` samples;
    /// a slow observer that falls behind sees its oldest un-consumed notify
    /// dropped on the next `notify_all` rather than blocking the dispatcher.
    pub fn watch(&mut self, capacity: usize) -> WatcherHandle {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        self.senders.push(sender);
        WatcherHandle { receiver }
    }

    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.senders.len()
    }

    /// Sends a copy of `stats` to every live watcher, then sweeps out any
    /// whose receiving half has been dropped. A full mailbox is not
    /// considered dead — that sample is simply skipped for that watcher; no
    /// retries are made (§4.8, §5: "no backpressure").
    pub fn notify_all(&mut self, stats: KernelStats) {
        self.senders.retain(|sender| match sender.try_send(stats) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> KernelStats {
        KernelStats { total: 1000, free: 100, ..Default::default() }
    }

    #[tokio::test]
    async fn notify_reaches_every_live_watcher() {
        let mut watchers = Watchers::new();
        let mut a = watchers.watch(4);
        let mut b = watchers.watch(4);

        watchers.notify_all(stats());

        assert_eq!(a.recv().await.unwrap().free, 100);
        assert_eq!(b.recv().await.unwrap().free, 100);
    }

    #[tokio::test]
    async fn dropped_watcher_is_swept_on_next_notify() {
        let mut watchers = Watchers::new();
        let handle = watchers.watch(4);
        drop(handle);
        assert_eq!(watchers.watcher_count(), 1);

        watchers.notify_all(stats());
        assert_eq!(watchers.watcher_count(), 0);
    }

    #[tokio::test]
    async fn full_mailbox_is_not_treated_as_dead() {
        let mut watchers = Watchers::new();
        let mut handle = watchers.watch(1);
        watchers.notify_all(stats());
        watchers.notify_all(stats());
        assert_eq!(watchers.watcher_count(), 1);
        assert!(handle.recv().await.is_some());
    }
}
