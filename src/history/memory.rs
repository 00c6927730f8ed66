//! In-memory history adapter.
//!
//! The only adapter that makes sense without a host platform: tests, SSR
//! warm-up, and headless embedding. Entries live in a vector with a cursor;
//! pushing truncates any forward entries first.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    create_location, parse_path, History, HistoryAction, HistoryListener, HistoryUpdate, Location,
};

struct MemoryHistoryInner {
    entries: Vec<Location>,
    index: usize,
    action: HistoryAction,
    listener: Option<Arc<HistoryListener>>,
}

/// An in-memory URL stack.
pub struct MemoryHistory {
    inner: Mutex<MemoryHistoryInner>,
}

impl MemoryHistory {
    /// Create a history seeded with the given entries, current at the last.
    ///
    /// The first entry receives the key "default" so a fresh router and a
    /// hydrated router agree on the initial location key.
    pub fn new(initial_entries: &[&str]) -> Arc<Self> {
        let entries: Vec<Location> = if initial_entries.is_empty() {
            vec![initial_location("/", true)]
        } else {
            initial_entries
                .iter()
                .enumerate()
                .map(|(i, entry)| initial_location(entry, i == 0))
                .collect()
        };
        let index = entries.len() - 1;

        Arc::new(Self {
            inner: Mutex::new(MemoryHistoryInner {
                entries,
                index,
                action: HistoryAction::Pop,
                listener: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MemoryHistoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of entries in the stack.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Current cursor position.
    pub fn index(&self) -> usize {
        self.lock().index
    }
}

fn initial_location(path: &str, first: bool) -> Location {
    let key = first.then(|| "default".to_string());
    create_location("/", &parse_path(path), None, key)
}

impl History for MemoryHistory {
    fn action(&self) -> HistoryAction {
        self.lock().action
    }

    fn location(&self) -> Location {
        let inner = self.lock();
        inner.entries[inner.index].clone()
    }

    fn push(&self, location: Location) {
        let mut inner = self.lock();
        inner.action = HistoryAction::Push;
        let next = inner.index + 1;
        inner.entries.truncate(next);
        inner.entries.push(location);
        inner.index = next;
    }

    fn replace(&self, location: Location) {
        let mut inner = self.lock();
        inner.action = HistoryAction::Replace;
        let index = inner.index;
        inner.entries[index] = location;
    }

    fn go(&self, delta: i64) {
        let (listener, update) = {
            let mut inner = self.lock();
            let target = inner.index as i64 + delta;
            let clamped = target.clamp(0, inner.entries.len() as i64 - 1) as usize;
            inner.action = HistoryAction::Pop;
            inner.index = clamped;
            let update = HistoryUpdate {
                action: HistoryAction::Pop,
                location: inner.entries[clamped].clone(),
                delta: Some(delta),
            };
            (inner.listener.clone(), update)
        };

        // Invoke outside the lock so the listener may read back through us
        if let Some(listener) = listener {
            listener(update);
        }
    }

    fn listen(&self, listener: HistoryListener) {
        self.lock().listener = Some(Arc::new(listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(path: &str) -> Location {
        create_location("/", &parse_path(path), None, None)
    }

    #[test]
    fn test_initial_state() {
        let history = MemoryHistory::new(&[]);
        assert_eq!(history.location().pathname, "/");
        assert_eq!(history.location().key, "default");
        assert_eq!(history.action(), HistoryAction::Pop);
    }

    #[test]
    fn test_push_truncates_forward_entries() {
        let history = MemoryHistory::new(&["/a", "/b", "/c"]);
        assert_eq!(history.index(), 2);

        history.go(-2);
        assert_eq!(history.location().pathname, "/a");

        history.push(location("/d"));
        assert_eq!(history.len(), 2);
        assert_eq!(history.location().pathname, "/d");
        assert_eq!(history.action(), HistoryAction::Push);
    }

    #[test]
    fn test_replace_keeps_length() {
        let history = MemoryHistory::new(&["/a", "/b"]);
        history.replace(location("/b2"));
        assert_eq!(history.len(), 2);
        assert_eq!(history.location().pathname, "/b2");
    }

    #[test]
    fn test_go_clamps_and_notifies() {
        let history = MemoryHistory::new(&["/a", "/b"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        history.listen(Box::new(move |update| {
            sink.lock().unwrap().push((update.location.pathname.clone(), update.delta));
        }));

        history.go(-1);
        history.go(-5);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("/a".to_string(), Some(-1)));
        // Clamped to the first entry
        assert_eq!(seen[1], ("/a".to_string(), Some(-5)));
    }
}
