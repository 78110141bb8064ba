//! Expiry-ordered probe queue.
//!
//! # Responsibilities
//! - Track every admitted connection with its next probe deadline
//! - Remember whether the peer answered since the last probe
//! - Run one bounded sweep: probe responsive peers, drop silent ones
//!
//! # Design Decisions
//! - Ordered index `(expire_at, id)` so due items are always at the front
//!   and a sweep never scans entries that are not due
//! - At most `budget` entries are taken per sweep regardless of queue size
//! - The responded flag lives in the entry, so removing the entry on close
//!   is the only cleanup needed

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::net::connection::{ConnectionHandle, ConnectionId};

#[derive(Debug)]
struct Entry {
    handle: ConnectionHandle,
    expire_at: Instant,
    responded: bool,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries inside the sweep window (due plus deferred). Never exceeds the budget.
    pub inspected: usize,
    /// Responsive entries that were re-armed and pinged.
    pub probed: usize,
    /// Silent entries that were terminated and removed.
    pub terminated: usize,
    /// Entries inside the window whose deadline has not passed yet.
    pub deferred: usize,
}

/// Connections ordered by their next probe deadline.
#[derive(Debug, Default)]
pub struct ExpiryQueue {
    entries: HashMap<ConnectionId, Entry>,
    order: BTreeSet<(Instant, ConnectionId)>,
}

impl ExpiryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Track a connection. Newly admitted peers count as responsive.
    pub fn insert(&mut self, handle: ConnectionHandle, expire_at: Instant) {
        let id = handle.id();
        self.remove(id);
        self.order.insert((expire_at, id));
        self.entries.insert(
            id,
            Entry {
                handle,
                expire_at,
                responded: true,
            },
        );
    }

    /// Stop tracking a connection.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionHandle> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&(entry.expire_at, id));
        Some(entry.handle)
    }

    /// Record a liveness response. Returns false for unknown connections.
    pub fn mark_responded(&mut self, id: ConnectionId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.responded = true;
                true
            }
            None => false,
        }
    }

    pub fn handles(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.entries.values().map(|e| &e.handle)
    }

    /// Entries whose deadline has passed. Walks the overdue prefix only.
    pub fn overdue(&self, now: Instant) -> usize {
        self.order.iter().take_while(|(at, _)| *at <= now).count()
    }

    /// Run one heartbeat cycle.
    pub fn sweep(&mut self, now: Instant, budget: usize, timeout: Duration) -> SweepReport {
        let mut due = Vec::with_capacity(budget.min(self.order.len()));
        while due.len() < budget {
            match self.order.first() {
                Some(&(expire_at, id)) if expire_at <= now => {
                    self.order.pop_first();
                    due.push(id);
                }
                _ => break,
            }
        }

        let deferred = (budget - due.len()).min(self.order.len());
        let mut report = SweepReport {
            inspected: due.len() + deferred,
            deferred,
            ..SweepReport::default()
        };

        for id in due {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };

            if !entry.responded {
                if let Some(entry) = self.entries.remove(&id) {
                    tracing::debug!(connection_id = %id, "No pong since last probe, terminating");
                    entry.handle.terminate();
                    report.terminated += 1;
                }
                continue;
            }

            entry.expire_at = now + timeout;
            entry.responded = false;
            self.order.insert((entry.expire_at, id));
            entry.handle.ping();
            report.probed += 1;
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Outbound;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        ConnectionHandle::new(ConnectionId::new())
    }

    #[test]
    fn test_not_due_is_never_probed_early() {
        let now = Instant::now();
        let mut queue = ExpiryQueue::new();
        let (conn, mut rx) = handle();
        queue.insert(conn, now + TIMEOUT);

        let report = queue.sweep(now, 8, TIMEOUT);
        assert_eq!(report.probed, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.inspected, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_responsive_connection_is_rearmed_and_pinged() {
        let now = Instant::now();
        let mut queue = ExpiryQueue::new();
        let (conn, mut rx) = handle();
        let id = conn.id();
        queue.insert(conn, now);

        let report = queue.sweep(now, 8, TIMEOUT);
        assert_eq!(report.probed, 1);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);

        // Re-armed for a full timeout; a second sweep right away does nothing.
        let report = queue.sweep(now + Duration::from_secs(1), 8, TIMEOUT);
        assert_eq!(report.probed, 0);
        assert_eq!(report.deferred, 1);

        assert!(queue.mark_responded(id));
        let report = queue.sweep(now + TIMEOUT, 8, TIMEOUT);
        assert_eq!(report.probed, 1);
        assert_eq!(report.terminated, 0);
        assert!(queue.contains(id));
    }

    #[test]
    fn test_silent_connection_is_terminated() {
        let now = Instant::now();
        let mut queue = ExpiryQueue::new();
        let (conn, _rx) = handle();
        let id = conn.id();
        let watcher = conn.clone();
        queue.insert(conn, now);

        queue.sweep(now, 8, TIMEOUT);
        let report = queue.sweep(now + TIMEOUT, 8, TIMEOUT);

        assert_eq!(report.terminated, 1);
        assert!(watcher.is_terminated());
        assert!(!queue.contains(id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_removed_connection_is_never_revisited() {
        let now = Instant::now();
        let mut queue = ExpiryQueue::new();
        let (conn, mut rx) = handle();
        let id = conn.id();
        queue.insert(conn, now);

        assert!(queue.remove(id).is_some());
        assert!(queue.remove(id).is_none());
        let report = queue.sweep(now, 8, TIMEOUT);
        assert_eq!(report, SweepReport::default());
        assert!(rx.try_recv().is_err());
        assert!(!queue.mark_responded(id));
    }

    fn assert_bounded(size: usize) {
        let now = Instant::now();
        let budget = 4;
        let mut queue = ExpiryQueue::new();
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (conn, rx) = handle();
            queue.insert(conn, now);
            receivers.push(rx);
        }

        let report = queue.sweep(now, budget, TIMEOUT);
        assert!(report.inspected <= budget);
        assert_eq!(report.probed, budget.min(size));
        assert_eq!(queue.overdue(now), size - budget.min(size));
        assert_eq!(queue.len(), size);
    }

    #[test]
    fn test_sweep_cost_bounded_for_small_pool() {
        assert_bounded(10);
    }

    #[test]
    fn test_sweep_cost_bounded_for_large_pool() {
        assert_bounded(10_000);
    }

    #[test]
    fn test_oldest_deadline_first() {
        let now = Instant::now();
        let mut queue = ExpiryQueue::new();
        let (late, mut late_rx) = handle();
        let (early, mut early_rx) = handle();
        queue.insert(late, now + Duration::from_secs(5));
        queue.insert(early, now);

        let later = now + Duration::from_secs(5);
        let report = queue.sweep(later, 1, TIMEOUT);
        assert_eq!(report.probed, 1);
        assert_eq!(early_rx.try_recv().unwrap(), Outbound::Ping);
        assert!(late_rx.try_recv().is_err());

        queue.sweep(later, 1, TIMEOUT);
        assert_eq!(late_rx.try_recv().unwrap(), Outbound::Ping);
    }
}
