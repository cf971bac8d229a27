//! Owned collection of managed workers

use std::collections::HashMap;

use crate::worker::ManagedWorker;

struct Entry {
    seq: u64,
    worker: ManagedWorker,
}

/// Workers keyed by name, remembering the order they were added
///
/// Replacing a worker keeps its original position, so "most recently added"
/// is stable across restarts.
#[derive(Default)]
pub(crate) struct WorkerSet {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ManagedWorker> {
        self.entries.get(name).map(|entry| &entry.worker)
    }

    /// Add a worker under a new name; returns false if the name is taken
    pub fn insert(&mut self, worker: ManagedWorker) -> bool {
        if self.entries.contains_key(worker.name()) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries
            .insert(worker.name().to_string(), Entry { seq, worker });
        true
    }

    /// Swap in a new instance for an existing name, returning the old one
    pub fn replace(&mut self, worker: ManagedWorker) -> Option<ManagedWorker> {
        match self.entries.get_mut(worker.name()) {
            Some(entry) => Some(std::mem::replace(&mut entry.worker, worker)),
            None => {
                self.insert(worker);
                None
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ManagedWorker> {
        self.entries.remove(name).map(|entry| entry.worker)
    }

    /// Workers in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &ManagedWorker> {
        self.entries.values().map(|entry| &entry.worker)
    }

    /// Workers in the order they were added
    pub fn in_add_order(&self) -> Vec<&ManagedWorker> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| &entry.worker).collect()
    }

    #[cfg(test)]
    pub fn names(&self) -> Vec<String> {
        self.in_add_order()
            .into_iter()
            .map(|worker| worker.name().to_string())
            .collect()
    }
}
