//! Bidirectional interning of entity-type names.
//!
//! Ids are assigned in insertion order during training and frozen when the
//! model is saved. At inference the map is read-only: unknown names surface
//! as [`ENTITY_UNKNOWN`].

use std::collections::HashMap;

use crate::bilou::{ENTITY_UNKNOWN, EntityId};
use crate::codec::{Reader, Result, Writer};

#[derive(Debug, Default)]
pub struct EntityMap {
    id2name: Vec<String>,
    name2id: HashMap<String, EntityId>,
}

impl EntityMap {
    pub fn new() -> Self {
        EntityMap::default()
    }

    /// Look up an entity name; unknown names yield [`ENTITY_UNKNOWN`].
    pub fn parse(&self, name: &str) -> EntityId {
        self.name2id.get(name).copied().unwrap_or(ENTITY_UNKNOWN)
    }

    /// Look up an entity name, admitting it with the next free id if absent.
    pub fn parse_or_add(&mut self, name: &str) -> EntityId {
        if let Some(&id) = self.name2id.get(name) {
            return id;
        }
        let id = self.id2name.len() as EntityId;
        self.id2name.push(name.to_string());
        self.name2id.insert(name.to_string(), id);
        id
    }

    /// The name for an id, or `""` when the id is out of range.
    pub fn name(&self, entity: EntityId) -> &str {
        self.id2name
            .get(entity as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Number of admitted entity types.
    pub fn len(&self) -> usize {
        self.id2name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id2name.is_empty()
    }

    /// All entity names in id order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.id2name.iter().map(String::as_str)
    }

    pub fn load(r: &mut Reader) -> Result<Self> {
        let count = r.next_u32()? as usize;
        let mut map = EntityMap::default();
        map.id2name.reserve(count);
        for i in 0..count {
            let name = r.next_str()?;
            map.name2id.insert(name.clone(), i as EntityId);
            map.id2name.push(name);
        }
        Ok(map)
    }

    pub fn save(&self, w: &mut Writer) {
        w.put_u32(self.id2name.len() as u32);
        for name in &self.id2name {
            w.put_str(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_add_round_trip() {
        let mut map = EntityMap::new();
        let per = map.parse_or_add("PER");
        let loc = map.parse_or_add("LOC");
        assert_eq!(per, 0);
        assert_eq!(loc, 1);
        assert_eq!(map.name(per), "PER");
        assert_eq!(map.name(loc), "LOC");
        // Re-adding returns the existing id
        assert_eq!(map.parse_or_add("PER"), per);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_parse_unknown() {
        let mut map = EntityMap::new();
        map.parse_or_add("PER");
        assert_eq!(map.parse("ORG"), ENTITY_UNKNOWN);
        assert_eq!(map.name(ENTITY_UNKNOWN), "");
        assert_eq!(map.name(17), "");
    }

    #[test]
    fn test_save_load() {
        let mut map = EntityMap::new();
        map.parse_or_add("PER");
        map.parse_or_add("ORG");
        map.parse_or_add("LOC");

        let mut w = Writer::new();
        map.save(&mut w);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        let loaded = EntityMap::load(&mut r).unwrap();
        assert!(r.is_end());
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.parse("ORG"), 1);
        assert_eq!(loaded.name(2), "LOC");
        assert_eq!(
            loaded.names().collect::<Vec<_>>(),
            vec!["PER", "ORG", "LOC"]
        );
    }
}
