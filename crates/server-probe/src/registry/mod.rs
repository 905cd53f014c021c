// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Authoritative collection of server records.
//!
//! Records live in an arena addressed by generational [`RecordId`]s, so an id
//! held by a stale resolution or probe never reaches a record that reused the
//! slot. Each category has a group holding its members in insertion order.

mod filter;
mod naming;
mod record;

use std::fmt;
use std::net::SocketAddr;

use log::info;

pub use filter::{FilterMode, ServerFilter};
pub use naming::{split_tag, unique_name};
pub use record::{
    AddressState, Category, HostSpec, Population, ServerDetails, ServerIdentity, ServerRecord,
    DISCOVERY_PREFIX,
};

/// Stable handle to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    index: u32,
    generation: u32,
}

impl RecordId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Bucket of records sharing a category.
#[derive(Debug, Clone)]
pub struct Group {
    category: Category,
    members: Vec<RecordId>,
}

impl Group {
    fn new(category: Category) -> Self {
        Self {
            category,
            members: Vec::new(),
        }
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.category.label()
    }

    /// Member ids in insertion order.
    #[must_use]
    pub fn members(&self) -> &[RecordId] {
        &self.members
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<ServerRecord>,
}

/// Arena of server records grouped by category.
pub struct ServerRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    groups: [Group; 3],
    public_enabled: bool,
    len: usize,
}

impl fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("records", &self.len)
            .field("public_enabled", &self.public_enabled)
            .finish_non_exhaustive()
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ServerRegistry {
    /// Create an empty registry. `public_enabled` controls whether the
    /// Public group is shown.
    #[must_use]
    pub fn new(public_enabled: bool) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            groups: Category::ALL.map(Group::new),
            public_enabled,
            len: 0,
        }
    }

    /// Insert a record as given.
    pub fn add(&mut self, category: Category, identity: ServerIdentity) -> RecordId {
        let id = self.allocate();
        info!("Adding {} server '{}' ({})", category, identity.name, id);
        self.store(ServerRecord::new(id, category, identity));
        id
    }

    /// Insert a favorite from an external source, renaming it to avoid a
    /// clash with existing favorites.
    pub fn import_favorite(&mut self, mut identity: ServerIdentity) -> RecordId {
        identity.name = self.unique_favorite_name(&identity.name);
        self.add(Category::Favorite, identity)
    }

    /// File a copy of an existing record under Favorites, keeping its
    /// addresses and statistics.
    pub fn copy_to_favorites(&mut self, source: RecordId) -> Option<RecordId> {
        let original = self.find(source)?.clone();
        let id = self.allocate();

        let mut copy = ServerRecord::copied_from(id, Category::Favorite, &original);
        copy.identity.name = self.unique_favorite_name(&original.identity.name);
        info!("Copying '{}' to favorites as '{}'", original.name(), copy.name());

        self.store(copy);
        Some(id)
    }

    /// Remove a record. Its id is never valid again.
    pub fn remove(&mut self, id: RecordId) -> Option<ServerRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }

        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        self.group_mut(record.category()).members.retain(|m| *m != id);

        info!("Removed server '{}' ({})", record.name(), id);
        Some(record)
    }

    /// Remove every record of a category, returning the removed ids.
    pub fn clear_category(&mut self, category: Category) -> Vec<RecordId> {
        let ids = self.group(category).members.clone();
        for id in &ids {
            self.remove(*id);
        }
        ids
    }

    #[must_use]
    pub fn find(&self, id: RecordId) -> Option<&ServerRecord> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    #[must_use]
    pub fn find_mut(&mut self, id: RecordId) -> Option<&mut ServerRecord> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    #[must_use]
    pub fn contains(&self, id: RecordId) -> bool {
        self.find(id).is_some()
    }

    #[must_use]
    pub fn group(&self, category: Category) -> &Group {
        &self.groups[category_slot(category)]
    }

    /// Whether a group header is shown: Favorite and LAN only while they
    /// have members, Public whenever the public list is enabled.
    #[must_use]
    pub fn is_group_visible(&self, category: Category) -> bool {
        match category {
            Category::Favorite | Category::Lan => !self.group(category).is_empty(),
            Category::Public => self.public_enabled,
        }
    }

    /// Visible groups in category order.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups
            .iter()
            .filter(|group| self.is_group_visible(group.category))
    }

    #[must_use]
    pub fn public_enabled(&self) -> bool {
        self.public_enabled
    }

    /// Every record, grouped by category then insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ServerRecord> {
        self.groups
            .iter()
            .flat_map(|group| group.members.iter())
            .filter_map(|id| self.find(*id))
    }

    /// Records that currently have addresses, with those addresses.
    #[must_use]
    pub fn probe_targets(&self) -> Vec<(RecordId, Vec<SocketAddr>)> {
        self.iter()
            .filter(|record| record.is_probeable())
            .map(|record| (record.id(), record.addresses().to_vec()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First name derived from `proposed` that no favorite uses.
    #[must_use]
    pub fn unique_favorite_name(&self, proposed: &str) -> String {
        let favorites = self.group(Category::Favorite);
        unique_name(proposed, |candidate| {
            favorites
                .members
                .iter()
                .filter_map(|id| self.find(*id))
                .any(|record| record.name() == candidate)
        })
    }

    fn allocate(&mut self) -> RecordId {
        if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize].generation;
            return RecordId::new(index, generation);
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            record: None,
        });
        RecordId::new(index, 0)
    }

    fn store(&mut self, record: ServerRecord) {
        let id = record.id();
        self.group_mut(record.category()).members.push(id);
        self.slots[id.index as usize].record = Some(record);
        self.len += 1;
    }

    fn group_mut(&mut self, category: Category) -> &mut Group {
        &mut self.groups[category_slot(category)]
    }
}

fn category_slot(category: Category) -> usize {
    match category {
        Category::Favorite => 0,
        Category::Lan => 1,
        Category::Public => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str) -> ServerIdentity {
        ServerIdentity::new(name, HostSpec::parse("voice.example.org"), 64738)
    }

    #[test]
    fn test_add_and_find() {
        let mut registry = ServerRegistry::new(true);
        let id = registry.add(Category::Lan, identity("Den"));

        let record = registry.find(id).unwrap();
        assert_eq!(record.name(), "Den");
        assert_eq!(record.category(), Category::Lan);
        assert_eq!(registry.group(Category::Lan).members(), &[id]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_removed_id_stays_invalid_after_reuse() {
        let mut registry = ServerRegistry::new(true);
        let old = registry.add(Category::Public, identity("Old"));
        assert!(registry.remove(old).is_some());
        assert!(registry.remove(old).is_none());

        let new = registry.add(Category::Public, identity("New"));
        assert_ne!(old, new);
        assert!(registry.find(old).is_none());
        assert_eq!(registry.find(new).unwrap().name(), "New");
        assert_eq!(registry.group(Category::Public).members(), &[new]);
    }

    #[test]
    fn test_import_favorite_dedupes_names() {
        let mut registry = ServerRegistry::new(true);
        registry.add(Category::Favorite, identity("Home"));
        registry.add(Category::Favorite, identity("Home (2)"));

        let id = registry.import_favorite(identity("Home"));
        assert_eq!(registry.find(id).unwrap().name(), "Home (3)");
    }

    #[test]
    fn test_non_favorite_names_do_not_clash() {
        let mut registry = ServerRegistry::new(true);
        registry.add(Category::Public, identity("Home"));

        let id = registry.import_favorite(identity("Home"));
        assert_eq!(registry.find(id).unwrap().name(), "Home");
    }

    #[test]
    fn test_copy_to_favorites() {
        let mut registry = ServerRegistry::new(true);
        let public = registry.add(Category::Public, identity("Hub"));
        let address: SocketAddr = "192.0.2.7:64738".parse().unwrap();
        registry.find_mut(public).unwrap().set_addresses(vec![address]);
        registry.add(Category::Favorite, identity("Hub"));

        let copy = registry.copy_to_favorites(public).unwrap();
        let record = registry.find(copy).unwrap();
        assert_eq!(record.category(), Category::Favorite);
        assert_eq!(record.name(), "Hub (2)");
        assert_eq!(record.addresses(), &[address]);
        assert!(registry.contains(public));
    }

    #[test]
    fn test_group_visibility() {
        let mut registry = ServerRegistry::new(true);
        let visible: Vec<_> = registry.groups().map(Group::category).collect();
        assert_eq!(visible, vec![Category::Public]);

        let id = registry.add(Category::Lan, identity("Den"));
        let visible: Vec<_> = registry.groups().map(Group::category).collect();
        assert_eq!(visible, vec![Category::Lan, Category::Public]);

        registry.remove(id);
        assert!(!registry.is_group_visible(Category::Lan));
        assert!(!ServerRegistry::new(false).is_group_visible(Category::Public));
    }

    #[test]
    fn test_clear_category_and_probe_targets() {
        let mut registry = ServerRegistry::new(true);
        let favorite = registry.add(Category::Favorite, identity("Keep"));
        let a = registry.add(Category::Public, identity("A"));
        registry.add(Category::Public, identity("B"));

        let address: SocketAddr = "127.0.0.1:64738".parse().unwrap();
        registry.find_mut(favorite).unwrap().set_addresses(vec![address]);
        registry.find_mut(a).unwrap().set_addresses(vec![address]);
        assert_eq!(registry.probe_targets().len(), 2);

        let removed = registry.clear_category(Category::Public);
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.probe_targets(), vec![(favorite, vec![address])]);
    }
}
