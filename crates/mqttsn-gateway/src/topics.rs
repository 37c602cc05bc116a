// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic id to topic name mapping, one table per session.
//!
//! Ids `1..=predefined_size` are predefined and immutable. Dynamic ids are
//! handed out above that range in increasing order and never reused.

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct TopicMappingTable {
    by_id: HashMap<u16, String>,
    predefined_size: u16,
    next_id: u32,
}

impl TopicMappingTable {
    pub fn new(predefined_size: u16) -> Self {
        Self {
            by_id: HashMap::new(),
            predefined_size,
            next_id: predefined_size as u32 + 1,
        }
    }

    /// Table seeded with the predefined entries. Ids outside the
    /// predefined range are ignored.
    pub fn with_predefined<I>(predefined_size: u16, entries: I) -> Self
    where
        I: IntoIterator<Item = (u16, String)>,
    {
        let mut table = Self::new(predefined_size);
        for (id, name) in entries {
            if id != 0 && id <= predefined_size {
                table.by_id.insert(id, name);
            }
        }
        table
    }

    /// Id mapped to `name`, 0 if unknown. The smallest id wins when a name
    /// is mapped twice (predefined before dynamic).
    pub fn get_topic_id(&self, name: &str) -> u16 {
        self.by_id
            .iter()
            .filter(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
            .min()
            .unwrap_or(0)
    }

    pub fn get_topic_name(&self, id: u16) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn is_predefined(&self, id: u16) -> bool {
        id != 0 && id <= self.predefined_size
    }

    pub fn predefined_size(&self) -> u16 {
        self.predefined_size
    }

    /// Reserve the next dynamic id. `None` once the id space is exhausted.
    pub fn allocate_id(&mut self) -> Option<u16> {
        let id = u16::try_from(self.next_id).ok()?;
        self.next_id += 1;
        Some(id)
    }

    /// Map a dynamic id. Predefined ids are refused.
    pub fn assign(&mut self, id: u16, name: &str) -> bool {
        if id == 0 || self.is_predefined(id) {
            return false;
        }
        self.by_id.insert(id, name.to_string());
        true
    }

    /// Return the existing id for `name` or map a freshly allocated one.
    pub fn register(&mut self, name: &str) -> Option<u16> {
        match self.get_topic_id(name) {
            0 => {
                let id = self.allocate_id()?;
                self.assign(id, name);
                Some(id)
            }
            id => Some(id),
        }
    }

    /// Remove a dynamic mapping by id.
    pub fn remove_id(&mut self, id: u16) -> bool {
        if self.is_predefined(id) {
            return false;
        }
        self.by_id.remove(&id).is_some()
    }

    /// Remove every dynamic mapping of `name`. Returns the count removed.
    pub fn remove_name(&mut self, name: &str) -> usize {
        let predefined_size = self.predefined_size;
        let before = self.by_id.len();
        self.by_id
            .retain(|id, n| *id <= predefined_size || n.as_str() != name);
        before - self.by_id.len()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// True when `name` contains a `#` or `+` level.
pub fn is_wildcard(name: &str) -> bool {
    name.split('/').any(|level| level == "#" || level == "+")
}
