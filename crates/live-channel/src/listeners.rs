//! Listener registry: ordered callbacks per [`EventKind`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{Event, EventKind};

/// A registered callback. Invoked on the task that observed the event, never
/// while manager state is locked.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`ConnectionManager::on`](crate::ConnectionManager::on),
/// used to remove exactly that callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
}

impl ListenerRegistry {
    pub fn add(&mut self, kind: EventKind, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.by_kind.entry(kind).or_default().push((id, listener));
        id
    }

    /// Remove one listener, or every listener for `kind` when `id` is `None`.
    /// Returns how many were removed.
    pub fn remove(&mut self, kind: &EventKind, id: Option<ListenerId>) -> usize {
        let Some(entries) = self.by_kind.get_mut(kind) else {
            return 0;
        };
        let before = entries.len();
        match id {
            Some(id) => entries.retain(|(existing, _)| *existing != id),
            None => entries.clear(),
        }
        let removed = before - entries.len();
        if entries.is_empty() {
            self.by_kind.remove(kind);
        }
        removed
    }

    /// Snapshot of the callbacks for `kind`, in registration order.
    pub fn matching(&self, kind: &EventKind) -> Vec<Listener> {
        self.by_kind
            .get(kind)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: &EventKind) -> usize {
        self.by_kind.get(kind).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.by_kind.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Listener {
        let log = Arc::clone(log);
        Arc::new(move |_event: &Event| log.lock().unwrap().push(tag))
    }

    #[test]
    fn delivery_follows_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::default();
        registry.add(EventKind::Connected, recorder(&log, "first"));
        registry.add(EventKind::Connected, recorder(&log, "second"));
        registry.add(EventKind::Disconnected, recorder(&log, "other"));

        for listener in registry.matching(&EventKind::Connected) {
            listener(&Event::Connected);
        }
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn remove_single_and_all() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::default();
        let kind = EventKind::Topic("properties".to_string());
        let a = registry.add(kind.clone(), recorder(&log, "a"));
        registry.add(kind.clone(), recorder(&log, "b"));
        registry.add(kind.clone(), recorder(&log, "c"));

        assert_eq!(registry.remove(&kind, Some(a)), 1);
        assert_eq!(registry.remove(&kind, Some(a)), 0);
        assert_eq!(registry.count(&kind), 2);

        assert_eq!(registry.remove(&kind, None), 2);
        assert_eq!(registry.count(&kind), 0);
        assert!(registry.matching(&kind).is_empty());
    }

    #[test]
    fn ids_are_unique_across_kinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::default();
        let a = registry.add(EventKind::Connected, recorder(&log, "a"));
        let b = registry.add(EventKind::DataUpdate, recorder(&log, "b"));
        assert_ne!(a, b);
        // Removing with the wrong kind does nothing.
        assert_eq!(registry.remove(&EventKind::Connected, Some(b)), 0);
        registry.clear();
        assert_eq!(registry.count(&EventKind::Connected), 0);
    }
}
