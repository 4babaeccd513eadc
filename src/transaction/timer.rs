use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// A polled timer queue: entries are ordered by deadline and drained by
/// the endpoint's timer pump. Cancellation is by the id handed out at
/// scheduling time.
pub struct TimerQueue<T> {
    entries: RwLock<BTreeMap<(Instant, u64), T>>,
    by_id: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        TimerQueue {
            entries: RwLock::new(BTreeMap::new()),
            by_id: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn schedule(&self, after: Duration, value: T) -> u64 {
        self.schedule_at(Instant::now() + after, value)
    }

    pub fn schedule_at(&self, deadline: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert((deadline, id), value);
        }
        if let Ok(mut by_id) = self.by_id.write() {
            by_id.insert(id, deadline);
        }
        id
    }

    pub fn cancel(&self, id: u64) -> Option<T> {
        let deadline = self.by_id.write().ok()?.remove(&id)?;
        self.entries.write().ok()?.remove(&(deadline, id))
    }

    /// Remove and return every entry due at `now`.
    pub fn due(&self, now: Instant) -> Vec<T> {
        let mut fired = Vec::new();
        let keys = {
            let entries = match self.entries.read() {
                Ok(entries) => entries,
                Err(_) => return fired,
            };
            entries
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect::<Vec<_>>()
        };
        if keys.is_empty() {
            return fired;
        }
        if let Ok(mut entries) = self.entries.write() {
            for key in &keys {
                if let Some(value) = entries.remove(key) {
                    fired.push(value);
                }
            }
        }
        if let Ok(mut by_id) = self.by_id.write() {
            for (_, id) in keys {
                by_id.remove(&id);
            }
        }
        fired
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_cancel_due() {
        let queue = TimerQueue::new();
        let now = Instant::now();

        let id = queue.schedule_at(now, "first");
        assert_eq!(queue.cancel(id), Some("first"));
        assert_eq!(queue.cancel(id), None);

        queue.schedule_at(now, "second");
        queue.schedule_at(now + Duration::from_secs(5), "later");
        let fired = queue.due(now + Duration::from_secs(1));
        assert_eq!(fired, vec!["second"]);
        assert_eq!(queue.len(), 1);

        let fired = queue.due(now + Duration::from_secs(10));
        assert_eq!(fired, vec!["later"]);
        assert!(queue.is_empty());
    }
}
