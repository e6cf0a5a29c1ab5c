use super::wire::RequestId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

struct PendingEntry<T, E> {
    created_at: Instant,
    sender: oneshot::Sender<Result<T, E>>,
}

/// In-flight requests keyed by correlation id.
///
/// Each entry owns the sending half of a oneshot; the caller awaits the
/// receiving half. Entries leave the map exactly once: on resolve, on
/// [`remove`](Self::remove) (timeouts, or a dropped [`PendingTicket`]), or
/// through [`reject_all`](Self::reject_all).
pub struct PendingRequests<T, E> {
    entries: Mutex<HashMap<RequestId, PendingEntry<T, E>>>,
}

impl<T, E> Default for PendingRequests<T, E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T, E> PendingRequests<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> (RequestId, oneshot::Receiver<Result<T, E>>) {
        let (sender, receiver) = oneshot::channel();
        let mut entries = self.entries.lock();
        let mut id = RequestId::generate();
        while entries.contains_key(&id) {
            id = RequestId::generate();
        }
        entries.insert(
            id.clone(),
            PendingEntry {
                created_at: Instant::now(),
                sender,
            },
        );
        (id, receiver)
    }

    /// Like [`register`](Self::register), but the entry is removed as soon
    /// as the returned ticket is dropped, so a caller that stops waiting
    /// leaves nothing behind.
    pub fn track(&self) -> (PendingTicket<'_, T, E>, oneshot::Receiver<Result<T, E>>) {
        let (id, receiver) = self.register();
        (
            PendingTicket {
                pending: self,
                id,
            },
            receiver,
        )
    }

    /// Completes the entry for `id`. Returns the entry's age, or `None` when
    /// no such request is outstanding.
    pub fn resolve(&self, id: &RequestId, result: Result<T, E>) -> Option<Duration> {
        let entry = self.entries.lock().remove(id)?;
        let age = entry.created_at.elapsed();
        let _ = entry.sender.send(result);
        Some(age)
    }

    pub fn remove(&self, id: &RequestId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    pub fn reject_all(&self, mut error: impl FnMut() -> E) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.sender.send(Err(error()));
        }
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Owns one outstanding entry; dropping it removes the entry if it is still
/// there.
pub struct PendingTicket<'a, T, E> {
    pending: &'a PendingRequests<T, E>,
    id: RequestId,
}

impl<T, E> PendingTicket<'_, T, E> {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl<T, E> Drop for PendingTicket<'_, T, E> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_once() {
        let pending: PendingRequests<u32, String> = PendingRequests::new();
        let (id, rx) = pending.register();
        assert!(pending.resolve(&id, Ok(7)).is_some());
        assert!(pending.resolve(&id, Ok(8)).is_none());
        assert_eq!(rx.await.unwrap(), Ok(7));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn reject_all_drains_every_entry() {
        let pending: PendingRequests<u32, &'static str> = PendingRequests::new();
        let (_, first) = pending.register();
        let (_, second) = pending.register();
        assert_eq!(pending.reject_all(|| "cancelled"), 2);
        assert_eq!(first.await.unwrap(), Err("cancelled"));
        assert_eq!(second.await.unwrap(), Err("cancelled"));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn dropped_ticket_removes_its_entry() {
        let pending: PendingRequests<u32, ()> = PendingRequests::new();
        let (ticket, _rx) = pending.track();
        let id = ticket.id().clone();
        assert!(pending.contains(&id));
        drop(ticket);
        assert!(pending.is_empty());
        assert!(pending.resolve(&id, Ok(1)).is_none());
    }

    #[test]
    fn ids_are_unique_while_outstanding() {
        let pending: PendingRequests<(), ()> = PendingRequests::new();
        let (a, _rx_a) = pending.register();
        let (b, _rx_b) = pending.register();
        assert_ne!(a, b);
        assert!(pending.contains(&a) && pending.contains(&b));
    }
}
