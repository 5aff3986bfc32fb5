//! Per-session identity map.
//!
//! Owned by the session sequencer; nothing here is shared across tasks.

pub mod entry;

pub use entry::{EntityEntry, EntityStatus};

use crate::action::ActionId;
use crate::core::{EntityKey, Value};
use log::warn;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PersistenceContext {
    entries: HashMap<EntityKey, EntityEntry>,
    /// Entries whose insert waits for a database-generated identifier.
    delayed: HashMap<ActionId, EntityEntry>,
    next_generation: u64,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn stamp(&mut self, entry: &mut EntityEntry) -> u64 {
        self.next_generation += 1;
        entry.generation = self.next_generation;
        self.next_generation
    }

    /// Adds or replaces the entry for `key` and returns its generation.
    pub fn add_entry(&mut self, key: EntityKey, mut entry: EntityEntry) -> u64 {
        let generation = self.stamp(&mut entry);
        self.entries.insert(key, entry);
        generation
    }

    pub fn add_delayed(&mut self, ticket: ActionId, mut entry: EntityEntry) -> u64 {
        let generation = self.stamp(&mut entry);
        self.delayed.insert(ticket, entry);
        generation
    }

    pub fn get(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &EntityKey) -> Option<&mut EntityEntry> {
        self.entries.get_mut(key)
    }

    /// The entry for `key` only if it is still the one created at `generation`.
    pub fn get_current(&mut self, key: &EntityKey, generation: u64) -> Option<&mut EntityEntry> {
        self.entries
            .get_mut(key)
            .filter(|entry| entry.generation == generation)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn status(&self, key: &EntityKey) -> Option<EntityStatus> {
        self.entries.get(key).map(|entry| entry.status)
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityEntry> {
        self.entries.remove(key)
    }

    pub fn remove_current(&mut self, key: &EntityKey, generation: u64) -> Option<EntityEntry> {
        match self.entries.get(key) {
            Some(entry) if entry.generation == generation => self.entries.remove(key),
            _ => None,
        }
    }

    /// Moves a delayed entry under its generated identifier as `Managed`.
    pub fn resolve_delayed(&mut self, ticket: ActionId, id: Value) -> Option<EntityKey> {
        let mut entry = self.delayed.remove(&ticket)?;
        entry.instance.assign_identifier(id.clone());
        entry.id = Some(id.clone());
        entry.insert_action = None;
        if entry.status == EntityStatus::Saving {
            entry.status = EntityStatus::Managed;
        }
        let key = entry.descriptor.key(id);
        if self.entries.contains_key(&key) {
            warn!("Generated identifier {} replaces an existing entry", key);
        }
        self.entries.insert(key.clone(), entry);
        Some(key)
    }

    pub fn delayed_mut(&mut self, ticket: ActionId) -> Option<&mut EntityEntry> {
        self.delayed.get_mut(&ticket)
    }

    pub fn discard_delayed(&mut self, ticket: ActionId) -> Option<EntityEntry> {
        self.delayed.remove(&ticket)
    }

    pub fn delayed_count(&self) -> usize {
        self.delayed.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, &EntityEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.delayed.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.delayed.clear();
    }
}
