use crate::event::QueryEvent;
use crate::storage::archive::canonical_hash;
use crate::storage::Storage;
use crate::Result;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Everything-in-memory storage: tests and small captures. Interning
/// behaves exactly like the file-backed storage so either can feed the
/// transform.
#[derive(Default)]
pub struct InMemoryStorage {
    events: VecDeque<QueryEvent>,
    canonicals: HashMap<u64, (i64, Arc<String>)>,
    next_canonical_id: i64,
    bytes: u64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            next_canonical_id: 1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn canonical_count(&self) -> usize {
        self.canonicals.len()
    }
}

impl Storage for InMemoryStorage {
    fn add_query_event(&mut self, mut event: QueryEvent) -> Result<()> {
        let hash = canonical_hash(&event.canonical);
        let (canonical_id, text) = match self.canonicals.get(&hash) {
            Some((id, text)) => (*id, Arc::clone(text)),
            None => {
                let id = self.next_canonical_id;
                self.next_canonical_id += 1;
                self.canonicals
                    .insert(hash, (id, Arc::clone(&event.canonical)));
                (id, Arc::clone(&event.canonical))
            }
        };
        event.canonical_id = canonical_id;
        event.canonical = text;
        self.bytes += 64 + event.args.iter().map(|a| a.value.len() as u64).sum::<u64>();
        self.events.push_back(event);
        Ok(())
    }

    fn next_event(&mut self) -> Result<Option<QueryEvent>> {
        Ok(self.events.pop_front())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize;

    #[test]
    fn interning_matches_file_storage_semantics() {
        let mut storage = InMemoryStorage::new();
        for (i, sql) in ["SELECT 1", "SELECT 2", "INSERT INTO t VALUES (3)"]
            .iter()
            .enumerate()
        {
            let (canonical, args) = canonicalize(sql);
            storage
                .add_query_event(QueryEvent {
                    canonical: Arc::new(canonical),
                    args,
                    event_id: i as i64 + 1,
                    ..QueryEvent::default()
                })
                .unwrap();
        }
        assert_eq!(storage.canonical_count(), 2);
        let first = storage.next_event().unwrap().unwrap();
        let second = storage.next_event().unwrap().unwrap();
        assert_eq!(first.canonical_id, second.canonical_id);
    }
}
