//! Feature processor interface and the shared key → feature-id map.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::bilou::EntityId;
use crate::codec::{self, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::features::{Feature, Pipeline, TemplateResult};
use crate::sentence::{NamedEntity, Sentence};

/// One feature template instance.
///
/// `process_sentence` emits sparse features for every token; during training
/// `total` carries the model-wide id allocator so unknown keys can be
/// admitted on the fly. `process_entities` lets post-processing templates
/// rewrite the primitive entity list.
pub trait FeatureProcessor: Send + Sync {
    fn parse(
        &mut self,
        window: i32,
        args: &[String],
        entities: &mut EntityMap,
        total: &AtomicU32,
        pipeline: &Pipeline,
    ) -> TemplateResult<()>;

    fn load(&mut self, r: &mut Reader, pipeline: &Pipeline) -> codec::Result<()>;

    fn save(&self, w: &mut Writer);

    fn process_sentence(&self, sentence: &mut Sentence, total: Option<&AtomicU32>, buffer: &mut String);

    fn process_entities(
        &self,
        sentence: &Sentence,
        entities: &mut Vec<NamedEntity>,
        buffer: &mut Vec<NamedEntity>,
    ) {
        let _ = (sentence, entities, buffer);
    }

    fn gazetteers(&self, phrases: &mut Vec<String>, entities: Option<&mut Vec<EntityId>>) {
        let _ = (phrases, entities);
    }
}

/// Id-block shape claimed per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Emission at offsets `[-window, +window]`; each key claims
    /// `2·window + 1` ids with the base referring to the centre.
    Symmetric,
    /// Emission at offsets `[1, +window]` only; each key claims `window`
    /// ids, addressed as `base + 1 ..= base + window`.
    RightOnly,
}

/// Key → base-feature-id map shared by the lexical templates.
///
/// Read-only after load. During training new keys are admitted under a
/// single-writer discipline; the `RwLock` lets inference share the map
/// across threads without copies.
#[derive(Debug)]
pub struct KeyMap {
    window: i32,
    kind: WindowKind,
    map: RwLock<HashMap<String, Feature>>,
}

impl KeyMap {
    pub fn new(kind: WindowKind) -> Self {
        KeyMap {
            window: 0,
            kind,
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> i32 {
        self.window
    }

    /// Ids claimed by one key.
    fn claim(&self) -> u32 {
        match self.kind {
            WindowKind::Symmetric => 2 * self.window as u32 + 1,
            WindowKind::RightOnly => self.window as u32,
        }
    }

    /// Reset for a fresh template instance; the empty key is always admitted
    /// first so out-of-sentence padding has a stable id.
    pub fn init(&mut self, window: i32, total: &AtomicU32) {
        self.window = window;
        self.map.write().expect("key map poisoned").clear();
        self.lookup("", Some(total));
    }

    /// Look up a key; with `total` present, unknown keys claim the next id
    /// block and are admitted.
    pub fn lookup(&self, key: &str, total: Option<&AtomicU32>) -> Option<Feature> {
        if let Some(&feature) = self.map.read().expect("key map poisoned").get(key) {
            return Some(feature);
        }
        let total = total?;

        let mut map = self.map.write().expect("key map poisoned");
        if let Some(&feature) = map.get(key) {
            return Some(feature);
        }
        let start = total.fetch_add(self.claim(), Ordering::Relaxed);
        let base = match self.kind {
            WindowKind::Symmetric => start + self.window as u32,
            WindowKind::RightOnly => start.wrapping_sub(1),
        };
        map.insert(key.to_string(), base);
        Some(base)
    }

    /// Read-only lookup.
    pub fn get(&self, key: &str) -> Option<Feature> {
        self.lookup(key, None)
    }

    /// Insert an arbitrary value (not an id block); used by templates that
    /// reuse the map for side lookups. Returns false on duplicates.
    pub fn insert_raw(&mut self, key: String, value: u32) -> bool {
        self.map
            .write()
            .expect("key map poisoned")
            .insert(key, value)
            .is_none()
    }

    pub fn get_raw(&self, key: &str) -> Option<u32> {
        self.map.read().expect("key map poisoned").get(key).copied()
    }

    pub fn load(&mut self, r: &mut Reader) -> codec::Result<()> {
        self.window = r.next_u32()? as i32;

        let capacity = r.next_u32()? as usize;
        let size = r.next_u32()? as usize;
        let mut map = HashMap::with_capacity(capacity.max(size));
        for _ in 0..size {
            let key = r.next_str()?;
            let value = r.next_u32()?;
            map.insert(key, value);
        }
        self.map = RwLock::new(map);
        Ok(())
    }

    pub fn save(&self, w: &mut Writer) {
        let map = self.map.read().expect("key map poisoned");
        w.put_u32(self.window as u32);
        w.put_u32(map.capacity() as u32);
        w.put_u32(map.len() as u32);

        // Sorted for deterministic artifacts
        let mut entries: Vec<(&String, &Feature)> = map.iter().collect();
        entries.sort();
        for (key, &value) in entries {
            w.put_str(key);
            w.put_u32(value);
        }
    }
}

/// Append `base + (w - i)` to `features[w]` for every `w ∈ [i+left, i+right]`
/// inside the sentence.
pub fn apply_in_range(
    sentence: &mut Sentence,
    i: isize,
    feature: Option<Feature>,
    left: i32,
    right: i32,
) {
    let Some(feature) = feature else { return };
    let from = (i + left as isize).max(0);
    let to = (i + right as isize + 1).min(sentence.size as isize);
    let mut w = from;
    while w < to {
        sentence.features[w as usize].push((feature as i64 + (w - i) as i64) as Feature);
        w += 1;
    }
}

/// Emission over the full window `[-window, +window]` around `i`.
pub fn apply_in_window(sentence: &mut Sentence, i: isize, feature: Option<Feature>, window: i32) {
    apply_in_range(sentence, i, feature, -window, window);
}

/// Emission as if the sentence were padded with synthetic positions
/// `-window..-1` and `size..size+window-1`.
pub fn apply_outer_words_in_window(sentence: &mut Sentence, feature: Option<Feature>, window: i32) {
    for k in 1..=window as isize {
        apply_in_window(sentence, -k, feature, window);
        apply_in_window(sentence, sentence.size as isize - 1 + k, feature, window);
    }
}
