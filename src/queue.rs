// src/queue.rs
//! Packets waiting for a route.
//!
//! Outbound data for a destination without a valid route is parked here
//! while discovery runs. Each entry carries the two continuations handed in
//! by the caller: one to forward the packet once a route exists, one to
//! report why it never will.

use std::fmt;
use std::time::Duration;

use crate::error::ForwardError;
use crate::packet::{Address, DataPacket};
use crate::routing::Route;
use crate::time::Time;

/// Continuation invoked with the resolved route.
pub type ForwardCallback = Box<dyn FnOnce(Route, DataPacket)>;

/// Continuation invoked when the packet is dropped.
pub type ErrorCallback = Box<dyn FnOnce(DataPacket, ForwardError)>;

pub struct QueueEntry {
    pub packet: DataPacket,
    pub forward: ForwardCallback,
    pub error: ErrorCallback,
    expires_at: Time,
}

impl QueueEntry {
    pub fn new(packet: DataPacket, forward: ForwardCallback, error: ErrorCallback) -> Self {
        QueueEntry {
            packet,
            forward,
            error,
            expires_at: Time::ZERO,
        }
    }

    pub fn destination(&self) -> Address {
        self.packet.destination()
    }

    pub fn expires_at(&self) -> Time {
        self.expires_at
    }

    fn drop_with(self, reason: &str) {
        tracing::debug!(
            uid = self.packet.uid,
            destination = %self.packet.destination(),
            "{reason}"
        );
        (self.error)(self.packet, ForwardError::NoRouteToHost);
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("packet", &self.packet)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Bounded FIFO of [`QueueEntry`] with lazy expiry.
#[derive(Debug)]
pub struct RequestQueue {
    entries: Vec<QueueEntry>,
    max_len: usize,
    timeout: Duration,
}

impl RequestQueue {
    pub fn new(max_len: usize, timeout: Duration) -> Self {
        RequestQueue {
            entries: Vec::new(),
            max_len,
            timeout,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Queue `entry`, evicting the oldest packet when full.
    ///
    /// Returns false if a packet with the same uid and destination is
    /// already waiting.
    pub fn enqueue(&mut self, mut entry: QueueEntry, now: Time) -> bool {
        self.purge(now);
        let duplicate = self.entries.iter().any(|e| {
            e.packet.uid == entry.packet.uid && e.destination() == entry.destination()
        });
        if duplicate {
            return false;
        }
        entry.expires_at = now + self.timeout;
        while !self.entries.is_empty() && self.entries.len() >= self.max_len {
            self.entries.remove(0).drop_with("dropping oldest queued packet");
        }
        self.entries.push(entry);
        true
    }

    /// Remove the oldest packet waiting for `dst`.
    pub fn dequeue(&mut self, dst: Address, now: Time) -> Option<QueueEntry> {
        self.purge(now);
        let idx = self.entries.iter().position(|e| e.destination() == dst)?;
        Some(self.entries.remove(idx))
    }

    /// Drop every packet waiting for `dst`, reporting no route to host.
    pub fn drop_all(&mut self, dst: Address, now: Time) {
        self.purge(now);
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.destination() == dst);
        self.entries = kept;
        for e in dropped {
            e.drop_with("dropping queued packet, no route");
        }
    }

    /// Drop packets that waited longer than the queue timeout.
    pub fn purge(&mut self, now: Time) {
        if self.entries.iter().all(|e| e.expires_at >= now) {
            return;
        }
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.expires_at < now);
        self.entries = kept;
        for e in expired {
            e.drop_with("dropping outdated queued packet");
        }
    }

    pub fn contains(&self, dst: Address) -> bool {
        self.entries.iter().any(|e| e.destination() == dst)
    }

    pub fn len(&mut self, now: Time) -> usize {
        self.purge(now);
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(u64, ForwardError)>>>;

    fn entry(uid: u64, dst: u16, log: &Log) -> QueueEntry {
        let log = Rc::clone(log);
        QueueEntry::new(
            DataPacket::new(uid, Address(1), Address(dst), Vec::new()),
            Box::new(|_, _| {}),
            Box::new(move |p, e| log.borrow_mut().push((p.uid, e))),
        )
    }

    #[test]
    fn overflow_evicts_oldest() {
        let log = Log::default();
        let mut q = RequestQueue::new(2, Duration::from_secs(30));
        let now = Time::ZERO;
        assert!(q.enqueue(entry(1, 9, &log), now));
        assert!(q.enqueue(entry(2, 9, &log), now));
        assert!(q.enqueue(entry(3, 9, &log), now));
        assert_eq!(q.len(now), 2);
        assert_eq!(*log.borrow(), vec![(1, ForwardError::NoRouteToHost)]);
        assert_eq!(q.dequeue(Address(9), now).unwrap().packet.uid, 2);
    }

    #[test]
    fn duplicate_uid_and_destination_rejected() {
        let log = Log::default();
        let mut q = RequestQueue::new(8, Duration::from_secs(30));
        let now = Time::ZERO;
        assert!(q.enqueue(entry(1, 9, &log), now));
        assert!(!q.enqueue(entry(1, 9, &log), now));
        assert!(q.enqueue(entry(1, 8, &log), now));
        assert_eq!(q.len(now), 2);
    }

    #[test]
    fn dequeue_is_fifo_per_destination() {
        let log = Log::default();
        let mut q = RequestQueue::new(8, Duration::from_secs(30));
        let now = Time::ZERO;
        q.enqueue(entry(1, 9, &log), now);
        q.enqueue(entry(2, 8, &log), now);
        q.enqueue(entry(3, 9, &log), now);
        assert_eq!(q.dequeue(Address(9), now).unwrap().packet.uid, 1);
        assert_eq!(q.dequeue(Address(9), now).unwrap().packet.uid, 3);
        assert!(q.dequeue(Address(9), now).is_none());
        assert!(q.contains(Address(8)));
    }

    #[test]
    fn expired_packets_report_errors() {
        let log = Log::default();
        let mut q = RequestQueue::new(8, Duration::from_secs(30));
        let start = Time::ZERO;
        q.enqueue(entry(1, 9, &log), start);
        q.enqueue(entry(2, 9, &log), start + Duration::from_secs(10));

        let now = start + Duration::from_secs(31);
        assert_eq!(q.len(now), 1);
        assert_eq!(log.borrow().len(), 1);

        // Nothing left to expire without time passing.
        q.purge(now);
        assert_eq!(q.len(now), 1);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn drop_all_only_hits_destination() {
        let log = Log::default();
        let mut q = RequestQueue::new(8, Duration::from_secs(30));
        let now = Time::ZERO;
        q.enqueue(entry(1, 9, &log), now);
        q.enqueue(entry(2, 8, &log), now);
        q.enqueue(entry(3, 9, &log), now);
        q.drop_all(Address(9), now);
        assert_eq!(q.len(now), 1);
        let uids: Vec<u64> = log.borrow().iter().map(|(u, _)| *u).collect();
        assert_eq!(uids, vec![1, 3]);
    }
}
