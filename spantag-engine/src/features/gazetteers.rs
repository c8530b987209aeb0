//! Gazetteer matching templates.
//!
//! [`Gazetteers`] is the legacy flat phrase map; [`GazetteersEnhanced`] is a
//! node-indexed trie over recased token strings with soft, hard-pre and
//! hard-post match modes. Hard-pre matches overwrite local probabilities
//! before classification; hard-post matches insert spans during entity
//! post-processing when nothing else covers them.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

use crate::bilou::{BilouTag, ENTITY_UNKNOWN, EntityId, LocalProbs};
use crate::codec::{self, CodecError, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::features::processor::{FeatureProcessor, KeyMap, WindowKind, apply_in_window};
use crate::features::{Feature, Pipeline, TemplateError, TemplateResult};
use crate::sentence::{NamedEntity, Sentence, TaggedWord};

// Sub-feature slots within each gazetteer's id block: a generic slot plus
// one per BILOU role of the token inside the matched phrase.
const ROLE_G: u32 = 0;
const ROLE_U: u32 = 1;
const ROLE_B: u32 = 2;
const ROLE_L: u32 = 3;
const ROLE_I: u32 = 4;
const ROLES_TOTAL: u32 = 5;

fn append_unless_exists<T: PartialEq + Copy>(values: &mut Vec<T>, value: T) {
    if !values.iter().rev().any(|&v| v == value) {
        values.push(value);
    }
}

/// Legacy flat gazetteer template keyed by space-joined raw lemmas.
pub struct Gazetteers {
    /// Phrase prefix → index into `info` (reusing the key map storage).
    keys: KeyMap,
    info: Vec<GazetteerInfo>,
}

#[derive(Default)]
struct GazetteerInfo {
    features: Vec<Feature>,
    prefix_of_longer: bool,
}

impl Gazetteers {
    pub fn new() -> Self {
        Gazetteers {
            keys: KeyMap::new(WindowKind::Symmetric),
            info: Vec::new(),
        }
    }
}

impl FeatureProcessor for Gazetteers {
    fn parse(
        &mut self,
        window: i32,
        args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        warn!("the 'Gazetteers' feature template is deprecated, use 'GazetteersEnhanced'");
        self.keys.init(window, total);
        self.info.clear();

        let span = 2 * window as u32 + 1;
        for path in args {
            let file = File::open(path).map_err(|e| {
                TemplateError::Parse(format!("cannot open gazetteers file '{path}': {e}"))
            })?;

            // All phrases of one file share one feature base
            let base = total.load(Ordering::Relaxed) + window as u32;
            let mut longest = 0usize;
            let mut phrase = String::new();
            for line in BufReader::new(file).lines() {
                let line = line?;
                let tokens: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();
                longest = longest.max(tokens.len());

                phrase.clear();
                for (i, token) in tokens.iter().enumerate() {
                    if i > 0 {
                        phrase.push(' ');
                    }
                    phrase.push_str(token);

                    let index = match self.keys.get_raw(&phrase) {
                        Some(index) => index,
                        None => {
                            let index = self.info.len() as u32;
                            self.keys.insert_raw(phrase.clone(), index);
                            self.info.push(GazetteerInfo::default());
                            index
                        }
                    };
                    let info = &mut self.info[index as usize];
                    if i + 1 < tokens.len() {
                        info.prefix_of_longer = true;
                    } else {
                        append_unless_exists(&mut info.features, base);
                    }
                }
            }

            let roles = match longest {
                0 => 0,
                1 => ROLE_U + 1,
                2 => ROLE_L + 1,
                _ => ROLE_I + 1,
            };
            total.fetch_add(span * roles, Ordering::Relaxed);
        }

        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)?;

        let count = r.next_u32()? as usize;
        self.info = Vec::with_capacity(count);
        for _ in 0..count {
            let prefix_of_longer = r.next_u8()? != 0;
            let features_len = r.next_u8()? as usize;
            let mut features = Vec::with_capacity(features_len);
            for _ in 0..features_len {
                features.push(r.next_u32()?);
            }
            self.info.push(GazetteerInfo {
                features,
                prefix_of_longer,
            });
        }
        Ok(())
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);

        w.put_u32(self.info.len() as u32);
        for info in &self.info {
            w.put_u8(info.prefix_of_longer as u8);
            w.put_u8(info.features.len() as u8);
            for &feature in &info.features {
                w.put_u32(feature);
            }
        }
    }

    fn process_sentence(&self, sentence: &mut Sentence, _total: Option<&AtomicU32>, buffer: &mut String) {
        let window = self.keys.window();
        let span = 2 * window as u32 + 1;

        for i in 0..sentence.size {
            let Some(mut index) = self.keys.get_raw(&sentence.words[i].raw_lemma) else {
                continue;
            };
            if index as usize >= self.info.len() {
                continue;
            }

            // Unigram match: generic + unit-role features
            for &feature in &self.info[index as usize].features {
                apply_in_window(sentence, i as isize, Some(feature + ROLE_G * span), window);
                apply_in_window(sentence, i as isize, Some(feature + ROLE_U * span), window);
            }

            let mut j = i + 1;
            while self.info[index as usize].prefix_of_longer && j < sentence.size {
                if j == i + 1 {
                    buffer.clear();
                    buffer.push_str(&sentence.words[i].raw_lemma);
                }
                buffer.push(' ');
                buffer.push_str(&sentence.words[j].raw_lemma);
                match self.keys.get_raw(buffer) {
                    Some(next) if (next as usize) < self.info.len() => index = next,
                    _ => break,
                }

                for &feature in &self.info[index as usize].features {
                    for g in i..=j {
                        let role = if g == i {
                            ROLE_B
                        } else if g == j {
                            ROLE_L
                        } else {
                            ROLE_I
                        };
                        apply_in_window(sentence, g as isize, Some(feature + ROLE_G * span), window);
                        apply_in_window(sentence, g as isize, Some(feature + role * span), window);
                    }
                }
                j += 1;
            }
        }
    }
}

/// Phrase source matched against the trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchSource {
    Form = 0,
    RawLemma = 1,
    RawLemmas = 2,
}

impl MatchSource {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(MatchSource::Form),
            1 => Some(MatchSource::RawLemma),
            2 => Some(MatchSource::RawLemmas),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmbedMode {
    InModel,
    OutOfModel,
}

/// How a terminal trie node interacts with the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    Soft = 0,
    HardPre = 1,
    HardPost = 2,
}

impl MatchMode {
    const ALL: [MatchMode; 3] = [MatchMode::Soft, MatchMode::HardPre, MatchMode::HardPost];

    fn suffix(self) -> &'static str {
        match self {
            MatchMode::Soft => ".txt",
            MatchMode::HardPre => ".hard_pre.txt",
            MatchMode::HardPost => ".hard_post.txt",
        }
    }

    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(MatchMode::Soft),
            1 => Some(MatchMode::HardPre),
            2 => Some(MatchMode::HardPost),
            _ => None,
        }
    }
}

struct GazetteerMeta {
    basename: String,
    feature: Feature,
    entity: EntityId,
}

struct GazetteerList {
    phrases: Vec<String>,
    feature: Feature,
    entity: EntityId,
    mode: MatchMode,
}

struct TrieNode {
    features: Vec<Feature>,
    /// Recased token string → child nodes (a multimap: distinct casings of
    /// different phrases can share a key).
    children: HashMap<String, Vec<u32>>,
    mode: MatchMode,
    entity: EntityId,
}

impl Default for TrieNode {
    fn default() -> Self {
        TrieNode {
            features: Vec::new(),
            children: HashMap::new(),
            mode: MatchMode::Soft,
            entity: ENTITY_UNKNOWN,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Recase {
    /// Only casings matching the observed case pattern (gazetteer side).
    Native,
    /// All casings the observed pattern could have produced (sentence side).
    Any,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Casing {
    Lower,
    Title,
    Upper,
}

/// Trie-backed gazetteers with per-list match modes.
pub struct GazetteersEnhanced {
    keys: KeyMap,
    match_source: MatchSource,
    embed: EmbedMode,
    metas: Vec<GazetteerMeta>,
    lists: Vec<GazetteerList>,
    trie: Vec<TrieNode>,
    entity_names: Vec<String>,
}

impl GazetteersEnhanced {
    pub fn new() -> Self {
        GazetteersEnhanced {
            keys: KeyMap::new(WindowKind::Symmetric),
            match_source: MatchSource::Form,
            embed: EmbedMode::OutOfModel,
            metas: Vec::new(),
            lists: Vec::new(),
            trie: Vec::new(),
            entity_names: Vec::new(),
        }
    }

    fn recase_text(&self, text: &str, casing: Casing, out: &mut Vec<String>) {
        let mut recased = String::with_capacity(text.len());
        match casing {
            Casing::Upper => {
                for chr in text.chars() {
                    recased.extend(chr.to_uppercase());
                }
            }
            Casing::Lower => {
                for chr in text.chars() {
                    recased.extend(chr.to_lowercase());
                }
            }
            Casing::Title => {
                for (i, chr) in text.chars().enumerate() {
                    if i == 0 {
                        recased.extend(chr.to_uppercase());
                    } else {
                        recased.extend(chr.to_lowercase());
                    }
                }
            }
        }
        out.push(recased);
    }

    fn recase_match_source(&self, word: &TaggedWord, mode: Recase, out: &mut Vec<String>) {
        let mut any_lower = false;
        let mut first_upper = false;
        for (i, chr) in word.form.chars().enumerate() {
            any_lower = any_lower || chr.is_lowercase();
            if i == 0 {
                first_upper = chr.is_uppercase();
            }
        }

        out.clear();
        for casing in [Casing::Lower, Casing::Title, Casing::Upper] {
            match mode {
                Recase::Native => {
                    if casing == Casing::Upper && !(first_upper && !any_lower) {
                        continue;
                    }
                    if casing == Casing::Title && !(first_upper && any_lower) {
                        continue;
                    }
                    if casing == Casing::Lower && first_upper {
                        continue;
                    }
                }
                Recase::Any => {
                    if casing == Casing::Upper && !(first_upper && !any_lower) {
                        continue;
                    }
                    if casing == Casing::Title && !first_upper {
                        continue;
                    }
                }
            }

            match self.match_source {
                MatchSource::Form => self.recase_text(&word.form, casing, out),
                MatchSource::RawLemma => self.recase_text(&word.raw_lemma, casing, out),
                MatchSource::RawLemmas => {
                    for raw_lemma in &word.raw_lemmas_all {
                        self.recase_text(raw_lemma, casing, out);
                    }
                }
            }
        }
    }

    /// Read any gazetteer list files next to the configured basenames and
    /// rebuild the trie from the embedded plus on-disk lists.
    fn load_gazetteer_lists(
        &mut self,
        pipeline: &Pipeline,
        files_must_exist: bool,
    ) -> TemplateResult<()> {
        for meta in &self.metas {
            for mode in MatchMode::ALL {
                let file_name = format!("{}{}", meta.basename, mode.suffix());
                let Ok(file) = File::open(&file_name) else {
                    if mode == MatchMode::Soft && files_must_exist {
                        return Err(TemplateError::Parse(format!(
                            "cannot open gazetteers file '{file_name}'"
                        )));
                    }
                    continue;
                };

                let mut phrases = Vec::new();
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if !line.is_empty() && !line.starts_with('#') {
                        phrases.push(line);
                    }
                }
                self.lists.push(GazetteerList {
                    phrases,
                    feature: meta.feature,
                    entity: meta.entity,
                    mode,
                });
            }
        }

        self.build_trie(pipeline);
        Ok(())
    }

    fn build_trie(&mut self, pipeline: &Pipeline) {
        self.trie.clear();
        self.trie.push(TrieNode::default());

        let mut prefix_ids: HashMap<String, u32> = HashMap::new();
        let mut tagged = Sentence::new();
        let mut recased = Vec::new();
        let mut prefix = String::new();

        for list in &self.lists {
            for phrase in &list.phrases {
                let sentences = pipeline.tokenizer.tokenize(phrase);
                let tokens: Vec<&str> = sentences
                    .iter()
                    .flatten()
                    .map(|range| &phrase[range.clone()])
                    .collect();
                if tokens.is_empty() {
                    continue;
                }

                let mut node = 0u32;
                prefix.clear();
                for (i, token) in tokens.iter().enumerate() {
                    if i > 0 {
                        prefix.push('\t');
                    }
                    prefix.push_str(token);

                    match prefix_ids.get(&prefix) {
                        Some(&id) => node = id,
                        None => {
                            let new_node = self.trie.len() as u32;
                            self.trie.push(TrieNode::default());
                            prefix_ids.insert(prefix.clone(), new_node);

                            pipeline.tagger.tag(&[token], &mut tagged);
                            self.recase_match_source(&tagged.words[0], Recase::Native, &mut recased);
                            for source in &recased {
                                let children = self.trie[node as usize]
                                    .children
                                    .entry(source.clone())
                                    .or_default();
                                append_unless_exists(children, new_node);
                            }
                            node = new_node;
                        }
                    }
                }

                let terminal = &mut self.trie[node as usize];
                append_unless_exists(&mut terminal.features, list.feature);
                if (list.mode == MatchMode::HardPre && terminal.mode != MatchMode::HardPre)
                    || (list.mode == MatchMode::HardPost && terminal.mode == MatchMode::Soft)
                {
                    terminal.mode = list.mode;
                    terminal.entity = list.entity;
                }
            }
        }
    }

    /// Advance all active trie nodes over the recased variants of token `j`.
    fn advance(&self, nodes: &[u32], new_nodes: &mut Vec<u32>, recased: &[String]) {
        new_nodes.clear();
        for &node in nodes {
            let children = &self.trie[node as usize].children;
            if children.is_empty() {
                continue;
            }
            for source in recased {
                if let Some(kids) = children.get(source) {
                    for &kid in kids {
                        append_unless_exists(new_nodes, kid);
                    }
                }
            }
        }
    }
}

impl FeatureProcessor for GazetteersEnhanced {
    fn parse(
        &mut self,
        window: i32,
        args: &[String],
        entities: &mut EntityMap,
        total: &AtomicU32,
        pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        self.metas.clear();
        self.lists.clear();

        if args.len() < 4 {
            return Err(TemplateError::Parse(
                "not enough parameters to GazetteersEnhanced".to_string(),
            ));
        }
        if args.len() % 2 != 0 {
            return Err(TemplateError::Parse(
                "odd number of parameters to GazetteersEnhanced".to_string(),
            ));
        }

        self.match_source = match args[0].as_str() {
            "form" => MatchSource::Form,
            "rawlemma" => MatchSource::RawLemma,
            "rawlemmas" => MatchSource::RawLemmas,
            other => {
                return Err(TemplateError::Parse(format!(
                    "first parameter of GazetteersEnhanced is '{other}', not one of form/rawlemma/rawlemmas"
                )));
            }
        };
        self.embed = match args[1].as_str() {
            "embed_in_model" => EmbedMode::InModel,
            "out_of_model" => EmbedMode::OutOfModel,
            other => {
                return Err(TemplateError::Parse(format!(
                    "second parameter of GazetteersEnhanced is '{other}', not one of [embed_in|out_of]_model"
                )));
            }
        };

        let span = 2 * window as u32 + 1;
        for pair in args[2..].chunks(2) {
            self.metas.push(GazetteerMeta {
                basename: pair[0].clone(),
                feature: total.fetch_add(ROLES_TOTAL * span, Ordering::Relaxed) + window as u32,
                entity: if pair[1] == "NONE" {
                    ENTITY_UNKNOWN
                } else {
                    entities.parse_or_add(&pair[1])
                },
            });
        }

        self.entity_names = entities.names().map(str::to_string).collect();

        let files_must_exist = self.embed == EmbedMode::InModel;
        self.load_gazetteer_lists(pipeline, files_must_exist)
    }

    fn load(&mut self, r: &mut Reader, pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)?;

        self.match_source = MatchSource::from_u32(r.next_u32()?)
            .ok_or_else(|| CodecError::Format("unknown gazetteer match source".to_string()))?;
        self.embed = EmbedMode::OutOfModel;

        let meta_count = r.next_u32()? as usize;
        self.metas = Vec::with_capacity(meta_count);
        for _ in 0..meta_count {
            self.metas.push(GazetteerMeta {
                basename: r.next_str()?,
                feature: r.next_u32()?,
                entity: r.next_u32()?,
            });
        }

        let list_count = r.next_u32()? as usize;
        self.lists = Vec::with_capacity(list_count);
        for _ in 0..list_count {
            let phrase_count = r.next_u32()? as usize;
            let mut phrases = Vec::with_capacity(phrase_count);
            for _ in 0..phrase_count {
                phrases.push(r.next_str()?);
            }
            self.lists.push(GazetteerList {
                phrases,
                feature: r.next_u32()?,
                entity: r.next_u32()?,
                mode: MatchMode::from_u32(r.next_u32()?)
                    .ok_or_else(|| CodecError::Format("unknown gazetteer mode".to_string()))?,
            });
        }

        let name_count = r.next_u32()? as usize;
        self.entity_names = Vec::with_capacity(name_count);
        for _ in 0..name_count {
            self.entity_names.push(r.next_str()?);
        }

        self.load_gazetteer_lists(pipeline, false)
            .map_err(|e| CodecError::Format(e.to_string()))?;
        Ok(())
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);

        w.put_u32(self.match_source as u32);

        w.put_u32(self.metas.len() as u32);
        for meta in &self.metas {
            w.put_str(&meta.basename);
            w.put_u32(meta.feature);
            w.put_u32(meta.entity);
        }

        if self.embed == EmbedMode::InModel {
            w.put_u32(self.lists.len() as u32);
            for list in &self.lists {
                w.put_u32(list.phrases.len() as u32);
                for phrase in &list.phrases {
                    w.put_str(phrase);
                }
                w.put_u32(list.feature);
                w.put_u32(list.entity);
                w.put_u32(list.mode as u32);
            }
        } else {
            w.put_u32(0);
        }

        w.put_u32(self.entity_names.len() as u32);
        for name in &self.entity_names {
            w.put_str(name);
        }
    }

    fn process_sentence(&self, sentence: &mut Sentence, _total: Option<&AtomicU32>, _buffer: &mut String) {
        if self.trie.len() <= 1 {
            return;
        }
        let window = self.keys.window();
        let span = 2 * window as u32 + 1;
        let size = sentence.size;

        let mut recased: Vec<Vec<String>> = vec![Vec::new(); size];
        for i in 0..size {
            self.recase_match_source(&sentence.words[i], Recase::Any, &mut recased[i]);
        }

        let mut collected: Vec<Vec<Feature>> = vec![Vec::new(); size];
        let mut nodes: Vec<u32> = Vec::new();
        let mut new_nodes: Vec<u32> = Vec::new();

        for i in 0..size {
            let mut hard_pre_length = 0usize;
            let mut hard_pre_node = u32::MAX;
            let mut hard_pre_possible = true;

            nodes.clear();
            nodes.push(0);
            let mut j = i;
            while j < size && !nodes.is_empty() {
                self.advance(&nodes, &mut new_nodes, &recased[j]);

                hard_pre_possible = hard_pre_possible && !sentence.probabilities[j].local_filled;
                if hard_pre_possible {
                    for &node in &new_nodes {
                        if self.trie[node as usize].mode == MatchMode::HardPre
                            && (j - i + 1 > hard_pre_length || node < hard_pre_node)
                        {
                            hard_pre_length = j - i + 1;
                            hard_pre_node = node;
                        }
                    }
                }

                for &node in &new_nodes {
                    for &feature in &self.trie[node as usize].features {
                        for k in i..=j {
                            let role = if j == i {
                                ROLE_U
                            } else if k == i {
                                ROLE_B
                            } else if k == j {
                                ROLE_L
                            } else {
                                ROLE_I
                            };
                            append_unless_exists(&mut collected[k], feature + ROLE_G * span);
                            append_unless_exists(&mut collected[k], feature + role * span);
                        }
                    }
                }

                std::mem::swap(&mut nodes, &mut new_nodes);
                j += 1;
            }

            if hard_pre_length > 0 {
                let entity = self.trie[hard_pre_node as usize].entity;
                for j in i..i + hard_pre_length {
                    let tag = if hard_pre_length == 1 {
                        BilouTag::U
                    } else if j == i {
                        BilouTag::B
                    } else if j + 1 == i + hard_pre_length {
                        BilouTag::L
                    } else {
                        BilouTag::I
                    };
                    let probs = &mut sentence.probabilities[j];
                    probs.local = LocalProbs::default();
                    probs.local[tag].probability = 1.0;
                    probs.local[tag].entity = entity;
                    probs.local_filled = true;
                }
            }
        }

        for i in 0..size {
            for &feature in &collected[i] {
                apply_in_window(sentence, i as isize, Some(feature), window);
            }
        }
    }

    fn process_entities(
        &self,
        sentence: &Sentence,
        entities: &mut Vec<NamedEntity>,
        buffer: &mut Vec<NamedEntity>,
    ) {
        if self.trie.len() <= 1 {
            return;
        }

        let mut recased: Vec<Vec<String>> = vec![Vec::new(); sentence.size];
        for i in 0..sentence.size {
            self.recase_match_source(&sentence.words[i], Recase::Any, &mut recased[i]);
        }

        buffer.clear();
        let mut nodes: Vec<u32> = Vec::new();
        let mut new_nodes: Vec<u32> = Vec::new();
        let mut entity_until = 0usize;
        let mut e = 0usize;

        for i in 0..sentence.size {
            while e < entities.len() && entities[e].start == i {
                entity_until = entity_until.max(i + entities[e].length);
                buffer.push(entities[e].clone());
                e += 1;
            }

            if entity_until <= i {
                // Free room before the next recognised entity
                let free_until = if e < entities.len() {
                    entities[e].start
                } else {
                    sentence.size
                };

                let mut hard_post_length = 0usize;
                let mut hard_post_node = u32::MAX;
                nodes.clear();
                nodes.push(0);
                let mut j = i;
                while j < free_until && !nodes.is_empty() {
                    self.advance(&nodes, &mut new_nodes, &recased[j]);

                    for &node in &new_nodes {
                        if self.trie[node as usize].mode == MatchMode::HardPost
                            && (j - i + 1 > hard_post_length || node < hard_post_node)
                        {
                            hard_post_length = j - i + 1;
                            hard_post_node = node;
                        }
                    }

                    std::mem::swap(&mut nodes, &mut new_nodes);
                    j += 1;
                }

                if hard_post_length > 0 {
                    let entity = self.trie[hard_post_node as usize].entity;
                    if let Some(name) = self.entity_names.get(entity as usize) {
                        buffer.push(NamedEntity::new(i, hard_post_length, name.clone()));
                        entity_until = i + hard_post_length;
                    }
                }
            }
        }

        if buffer.len() != entities.len() {
            std::mem::swap(entities, buffer);
        }
    }

    fn gazetteers(&self, phrases: &mut Vec<String>, mut entities: Option<&mut Vec<EntityId>>) {
        for list in &self.lists {
            for phrase in &list.phrases {
                phrases.push(phrase.clone());
                if let Some(entities) = entities.as_deref_mut() {
                    entities.push(list.entity);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagger::{Tagger as _, TrivialTagger, WhitespaceTokenizer};
    use std::io::Write as _;

    fn pipeline_args() -> (WhitespaceTokenizer, TrivialTagger) {
        (WhitespaceTokenizer, TrivialTagger)
    }

    fn parse_enhanced(dir: &std::path::Path, extra: &[(&str, &str)]) -> GazetteersEnhanced {
        let (tokenizer, tagger) = pipeline_args();
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: &tagger,
        };
        let mut entities = EntityMap::new();
        let total = AtomicU32::new(1);

        let mut args = vec!["form".to_string(), "out_of_model".to_string()];
        for (basename, entity) in extra {
            args.push(dir.join(basename).to_string_lossy().to_string());
            args.push(entity.to_string());
        }

        let mut processor = GazetteersEnhanced::new();
        processor
            .parse(0, &args, &mut entities, &total, &pipeline)
            .unwrap();
        processor
    }

    fn write_list(dir: &std::path::Path, name: &str, content: &str) {
        let mut f = File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    fn tagged(forms: &[&str]) -> Sentence {
        let mut sentence = Sentence::new();
        TrivialTagger.tag(forms, &mut sentence);
        for i in 0..sentence.size {
            sentence.features[i].clear();
        }
        sentence
    }

    #[test]
    fn test_soft_match_emits_role_features() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "cities.txt", "New York\nPrague\n");
        let processor = parse_enhanced(dir.path(), &[("cities", "LOC")]);

        let mut sentence = tagged(&["in", "New", "York", "today"]);
        let mut buffer = String::new();
        processor.process_sentence(&mut sentence, None, &mut buffer);

        assert!(sentence.features[0].is_empty());
        // Matched tokens carry the generic and the positional role feature
        assert_eq!(sentence.features[1].len(), 2);
        assert_eq!(sentence.features[2].len(), 2);
        assert!(sentence.features[3].is_empty());
        // Generic role is shared, positional role differs (B vs L)
        assert_eq!(sentence.features[1][0], sentence.features[2][0]);
        assert_ne!(sentence.features[1][1], sentence.features[2][1]);
        // Soft matches never touch local probabilities
        assert!(!sentence.probabilities[1].local_filled);
    }

    #[test]
    fn test_case_insensitive_lookup_of_titlecase_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "cities.txt", "Prague\n");
        let processor = parse_enhanced(dir.path(), &[("cities", "LOC")]);

        // Sentence-side "PRAGUE" is all-caps: its Title recasing reaches the
        // gazetteer's native titlecase key
        let mut sentence = tagged(&["PRAGUE"]);
        let mut buffer = String::new();
        processor.process_sentence(&mut sentence, None, &mut buffer);
        assert_eq!(sentence.features[0].len(), 2);

        // Lowercase "prague" has no uppercase first letter, so only the
        // lowercase recasing is tried and the titlecase entry is missed
        let mut sentence = tagged(&["prague"]);
        processor.process_sentence(&mut sentence, None, &mut buffer);
        assert!(sentence.features[0].is_empty());
    }

    #[test]
    fn test_hard_pre_overrides_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "orgs.hard_pre.txt", "United Nations Organization\n");
        write_list(dir.path(), "orgs.txt", "");
        let processor = parse_enhanced(dir.path(), &[("orgs", "ORG")]);

        let mut sentence = tagged(&["the", "United", "Nations", "Organization", "said"]);
        let mut buffer = String::new();
        processor.process_sentence(&mut sentence, None, &mut buffer);

        assert!(!sentence.probabilities[0].local_filled);
        for (idx, tag) in [(1, BilouTag::B), (2, BilouTag::I), (3, BilouTag::L)] {
            assert!(sentence.probabilities[idx].local_filled);
            assert_eq!(sentence.probabilities[idx].local[tag].probability, 1.0);
            assert_eq!(sentence.probabilities[idx].local[tag].entity, 0);
        }
        assert!(!sentence.probabilities[4].local_filled);
    }

    #[test]
    fn test_hard_pre_skips_already_filled_tokens() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "orgs.hard_pre.txt", "United Nations\n");
        write_list(dir.path(), "orgs.txt", "");
        let processor = parse_enhanced(dir.path(), &[("orgs", "ORG")]);

        let mut sentence = tagged(&["United", "Nations"]);
        sentence.probabilities[1].local_filled = true;
        let mut buffer = String::new();
        processor.process_sentence(&mut sentence, None, &mut buffer);

        // The two-token hard match is blocked by the locked token
        assert!(!sentence.probabilities[0].local_filled);
    }

    #[test]
    fn test_hard_post_inserts_span() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "places.hard_post.txt", "Mount Everest\n");
        write_list(dir.path(), "places.txt", "");
        let processor = parse_enhanced(dir.path(), &[("places", "LOC")]);

        let sentence = {
            let mut s = Sentence::new();
            TrivialTagger.tag(&["on", "Mount", "Everest", "today"], &mut s);
            s
        };
        let mut entities = Vec::new();
        let mut buffer = Vec::new();
        processor.process_entities(&sentence, &mut entities, &mut buffer);

        assert_eq!(entities, vec![NamedEntity::new(1, 2, "LOC")]);
    }

    #[test]
    fn test_hard_post_respects_existing_entities() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "places.hard_post.txt", "Mount Everest\n");
        write_list(dir.path(), "places.txt", "");
        let processor = parse_enhanced(dir.path(), &[("places", "LOC")]);

        let sentence = {
            let mut s = Sentence::new();
            TrivialTagger.tag(&["on", "Mount", "Everest", "today"], &mut s);
            s
        };
        // An entity already covers token 1, so no synthetic span fits
        let mut entities = vec![NamedEntity::new(0, 2, "X")];
        let mut buffer = Vec::new();
        processor.process_entities(&sentence, &mut entities, &mut buffer);

        assert_eq!(entities, vec![NamedEntity::new(0, 2, "X")]);
    }

    #[test]
    fn test_gazetteers_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "cities.txt", "Prague\nNew York\n");
        let processor = parse_enhanced(dir.path(), &[("cities", "LOC")]);

        let mut phrases = Vec::new();
        let mut types = Vec::new();
        processor.gazetteers(&mut phrases, Some(&mut types));
        assert_eq!(phrases, vec!["Prague", "New York"]);
        assert_eq!(types, vec![0, 0]);
    }

    #[test]
    fn test_enhanced_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "cities.txt", "Prague\n");
        let processor = parse_enhanced(dir.path(), &[("cities", "LOC")]);

        let mut w = Writer::new();
        processor.save(&mut w);
        let bytes = w.into_bytes();

        let (tokenizer, tagger) = pipeline_args();
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: &tagger,
        };
        let mut loaded = GazetteersEnhanced::new();
        loaded.load(&mut Reader::new(&bytes), &pipeline).unwrap();

        // Out-of-model lists are reloaded from disk next to the basename
        let mut sentence = tagged(&["Prague"]);
        let mut buffer = String::new();
        loaded.process_sentence(&mut sentence, None, &mut buffer);
        assert_eq!(sentence.features[0].len(), 2);
    }

    #[test]
    fn test_embed_in_model_requires_files() {
        let (tokenizer, tagger) = pipeline_args();
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: &tagger,
        };
        let mut entities = EntityMap::new();
        let total = AtomicU32::new(1);
        let mut processor = GazetteersEnhanced::new();
        let args: Vec<String> = ["form", "embed_in_model", "/nonexistent/base", "LOC"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(
            processor
                .parse(0, &args, &mut entities, &total, &pipeline)
                .is_err()
        );
    }

    #[test]
    fn test_legacy_gazetteers_match() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "list.txt", "New York\nParis\n");

        let (tokenizer, tagger) = pipeline_args();
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: &tagger,
        };
        let mut entities = EntityMap::new();
        let total = AtomicU32::new(1);
        let mut processor = Gazetteers::new();
        processor
            .parse(
                0,
                &[dir.path().join("list.txt").to_string_lossy().to_string()],
                &mut entities,
                &total,
                &pipeline,
            )
            .unwrap();

        let mut sentence = tagged(&["Paris", "New", "York"]);
        let mut buffer = String::new();
        processor.process_sentence(&mut sentence, None, &mut buffer);

        // Paris: unigram match (G + U)
        assert_eq!(sentence.features[0].len(), 2);
        // New York: bigram match (G + B / G + L); "New" alone is only a
        // prefix, so it carries no unigram features
        assert_eq!(sentence.features[1].len(), 2);
        assert_eq!(sentence.features[2].len(), 2);
    }

    #[test]
    fn test_legacy_gazetteers_save_load() {
        let dir = tempfile::tempdir().unwrap();
        write_list(dir.path(), "list.txt", "Alpha\nAlpha Beta\n");

        let (tokenizer, tagger) = pipeline_args();
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: &tagger,
        };
        let mut entities = EntityMap::new();
        let total = AtomicU32::new(1);
        let mut processor = Gazetteers::new();
        processor
            .parse(
                1,
                &[dir.path().join("list.txt").to_string_lossy().to_string()],
                &mut entities,
                &total,
                &pipeline,
            )
            .unwrap();

        let mut w = Writer::new();
        processor.save(&mut w);
        let bytes = w.into_bytes();

        let mut loaded = Gazetteers::new();
        loaded.load(&mut Reader::new(&bytes), &pipeline).unwrap();

        let mut expected = tagged(&["Alpha", "Beta"]);
        let mut actual = tagged(&["Alpha", "Beta"]);
        let mut buffer = String::new();
        processor.process_sentence(&mut expected, None, &mut buffer);
        loaded.process_sentence(&mut actual, None, &mut buffer);
        for i in 0..2 {
            assert_eq!(expected.features[i], actual.features[i]);
        }
    }
}
