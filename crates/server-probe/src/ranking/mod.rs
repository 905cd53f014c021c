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

//! Ordering of group headers and servers for display.
//!
//! Categories always appear in the order Favorite, LAN, Public, whichever way
//! the list is sorted; only the servers inside a category follow the sort
//! order. [`compare`] inverts category and header comparisons for descending
//! order so that a caller reversing the whole comparison for descending order
//! (as [`sort_entries`] does) keeps the categories in place.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::registry::{Category, Group, ServerFilter, ServerRecord, ServerRegistry};

/// Column the list is sorted by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortColumn {
    Name,
    #[default]
    Ping,
    Users,
    /// Any column without an ordering of its own.
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// A row of the list.
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    Group(&'a Group),
    Server(&'a ServerRecord),
}

impl Entry<'_> {
    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Entry::Group(group) => group.category(),
            Entry::Server(record) => record.category(),
        }
    }
}

/// Lower-case `name` and keep only ASCII letters and digits.
#[must_use]
pub fn normalized_name(name: &str) -> String {
    name.chars()
        .flat_map(char::to_lowercase)
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

fn ping_key(record: &ServerRecord) -> u32 {
    match record.stats().sort_ping_ms() {
        Some(ping) if ping > 0 => ping,
        _ => u32::MAX,
    }
}

fn directed(ordering: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Ascending => ordering,
        SortOrder::Descending => ordering.reverse(),
    }
}

/// Compare two rows for the given column and order.
#[must_use]
pub fn compare(a: &Entry<'_>, b: &Entry<'_>, column: SortColumn, order: SortOrder) -> Ordering {
    let by_category = a.category().cmp(&b.category());
    if by_category != Ordering::Equal {
        return directed(by_category, order);
    }

    match (a, b) {
        (Entry::Group(x), Entry::Group(y)) => directed(x.name().cmp(y.name()), order),
        (Entry::Group(_), Entry::Server(_)) => directed(Ordering::Less, order),
        (Entry::Server(_), Entry::Group(_)) => directed(Ordering::Greater, order),
        (Entry::Server(x), Entry::Server(y)) => match column {
            SortColumn::Name => normalized_name(x.name()).cmp(&normalized_name(y.name())),
            SortColumn::Ping => ping_key(x).cmp(&ping_key(y)),
            SortColumn::Users => x.population().users.cmp(&y.population().users),
            SortColumn::Other => Ordering::Equal,
        },
    }
}

/// Stable sort of `entries` for display.
pub fn sort_entries(entries: &mut [Entry<'_>], column: SortColumn, order: SortOrder) {
    match order {
        SortOrder::Ascending => entries.sort_by(|a, b| compare(a, b, column, order)),
        SortOrder::Descending => entries.sort_by(|a, b| compare(b, a, column, order)),
    }
}

/// Visible group headers and the servers passing `filter`, sorted.
#[must_use]
pub fn rank<'a>(
    registry: &'a ServerRegistry,
    column: SortColumn,
    order: SortOrder,
    filter: Option<&ServerFilter>,
) -> Vec<Entry<'a>> {
    let mut entries = Vec::with_capacity(registry.len() + Category::ALL.len());

    for group in registry.groups() {
        entries.push(Entry::Group(group));
        entries.extend(
            group
                .members()
                .iter()
                .filter_map(|id| registry.find(*id))
                .filter(|record| filter.map_or(true, |f| f.matches(record)))
                .map(Entry::Server),
        );
    }

    sort_entries(&mut entries, column, order);
    entries
}
