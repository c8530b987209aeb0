//! The inference engine: model loading, the per-sentence stage loop and
//! span extraction.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Mutex;

use tracing::debug;

use crate::bilou::{self, BilouTag, EntityId, LocalProbs};
use crate::classifier::NetworkClassifier;
use crate::codec::{self, CodecError, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::features::{FeatureTemplates, Pipeline};
use crate::sentence::{NamedEntity, Sentence};
use crate::tagger::{Tagger, TaggerKind, Tokenizer, WhitespaceTokenizer};

/// Model variants distinguished by the artifact's leading byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Czech = 0,
    English = 1,
    Generic = 2,
}

impl ModelVariant {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "czech" => Some(ModelVariant::Czech),
            "english" => Some(ModelVariant::English),
            "generic" => Some(ModelVariant::Generic),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ModelVariant::Czech),
            1 => Some(ModelVariant::English),
            2 => Some(ModelVariant::Generic),
            _ => None,
        }
    }
}

/// Per-call scratch state, pooled on the engine.
#[derive(Default)]
struct Cache {
    sentence: Sentence,
    outcomes: Vec<f64>,
    hidden: Vec<f64>,
    string_buffer: String,
    entities_buffer: Vec<NamedEntity>,
}

/// Scoped cache ownership: the cache returns to the pool on drop, on every
/// exit path.
struct CacheGuard<'a> {
    pool: &'a Mutex<Vec<Cache>>,
    cache: Option<Cache>,
}

impl<'a> CacheGuard<'a> {
    fn acquire(pool: &'a Mutex<Vec<Cache>>) -> Self {
        let cache = pool.lock().expect("cache pool poisoned").pop();
        CacheGuard {
            pool,
            cache: Some(cache.unwrap_or_default()),
        }
    }
}

impl Deref for CacheGuard<'_> {
    type Target = Cache;

    fn deref(&self) -> &Cache {
        self.cache.as_ref().expect("cache taken")
    }
}

impl DerefMut for CacheGuard<'_> {
    fn deref_mut(&mut self) -> &mut Cache {
        self.cache.as_mut().expect("cache taken")
    }
}

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.take() {
            self.pool.lock().expect("cache pool poisoned").push(cache);
        }
    }
}

/// A loaded multi-stage BILOU recognition engine.
///
/// Immutable after load; `recognize` may be called concurrently from any
/// number of threads.
pub struct Recognizer {
    pub(crate) variant: ModelVariant,
    pub(crate) tagger_kind: TaggerKind,
    pub(crate) tagger: Box<dyn Tagger>,
    pub(crate) entities: EntityMap,
    pub(crate) templates: FeatureTemplates,
    pub(crate) stages: Vec<NetworkClassifier>,
    caches: Mutex<Vec<Cache>>,
}

impl Recognizer {
    pub(crate) fn from_parts(
        variant: ModelVariant,
        tagger_kind: TaggerKind,
        tagger: Box<dyn Tagger>,
        entities: EntityMap,
        templates: FeatureTemplates,
        stages: Vec<NetworkClassifier>,
    ) -> Self {
        Recognizer {
            variant,
            tagger_kind,
            tagger,
            entities,
            templates,
            stages,
            caches: Mutex::new(Vec::new()),
        }
    }

    /// Load a model artifact from a byte stream.
    ///
    /// Layout: variant byte, tagger id byte, then one compressed block each
    /// for the entity map and the feature templates, one stage-count byte,
    /// and one compressed block per stage classifier.
    pub fn load(input: &mut dyn Read) -> codec::Result<Self> {
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte).map_err(|_| CodecError::Truncated)?;
        let variant = ModelVariant::from_u8(byte[0])
            .ok_or_else(|| CodecError::Format(format!("unknown model variant {}", byte[0])))?;

        let (tagger_kind, tagger) = TaggerKind::load(input)?;

        let block = codec::load_block(input)?;
        let mut r = Reader::new(&block);
        let entities = EntityMap::load(&mut r)?;
        if !r.is_end() {
            return Err(CodecError::Format(
                "trailing bytes after entity map".to_string(),
            ));
        }

        let tokenizer = WhitespaceTokenizer;
        let block = codec::load_block(input)?;
        let mut r = Reader::new(&block);
        let templates = {
            let pipeline = Pipeline {
                tokenizer: &tokenizer,
                tagger: tagger.as_ref(),
            };
            FeatureTemplates::load(&mut r, &pipeline)?
        };
        if !r.is_end() {
            return Err(CodecError::Format(
                "trailing bytes after feature templates".to_string(),
            ));
        }

        input.read_exact(&mut byte).map_err(|_| CodecError::Truncated)?;
        let stage_count = byte[0] as usize;
        if stage_count == 0 {
            return Err(CodecError::Format("model has zero stages".to_string()));
        }

        let mut stages = Vec::with_capacity(stage_count);
        for _ in 0..stage_count {
            let block = codec::load_block(input)?;
            let mut r = Reader::new(&block);
            let stage = NetworkClassifier::load(&mut r)?;
            if !r.is_end() {
                return Err(CodecError::Format(
                    "trailing bytes after stage classifier".to_string(),
                ));
            }
            stages.push(stage);
        }

        debug!(
            ?variant,
            entities = entities.len(),
            stages = stages.len(),
            total_features = templates.total_features(),
            "model loaded"
        );

        Ok(Recognizer::from_parts(
            variant, tagger_kind, tagger, entities, templates, stages,
        ))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> codec::Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::load(&mut BufReader::new(file))
    }

    /// Serialise the model artifact.
    pub fn save(&self, out: &mut dyn Write) -> codec::Result<()> {
        out.write_all(&[self.variant as u8])?;
        self.tagger_kind.save(out)?;

        let mut w = Writer::new();
        self.entities.save(&mut w);
        codec::save_writer(out, w)?;

        let mut w = Writer::new();
        self.templates.save(&mut w);
        codec::save_writer(out, w)?;

        out.write_all(&[self.stages.len() as u8])?;
        for stage in &self.stages {
            let mut w = Writer::new();
            stage.save(&mut w);
            codec::save_writer(out, w)?;
        }
        Ok(())
    }

    /// Recognise named entities in one tokenised sentence.
    ///
    /// Returned spans are sorted by start ascending, then length descending,
    /// so container entities precede the primitives they cover.
    pub fn recognize(&self, forms: &[&str]) -> Vec<NamedEntity> {
        let mut entities = Vec::new();
        if forms.is_empty() || self.entities.is_empty() {
            return entities;
        }

        let mut guard = CacheGuard::acquire(&self.caches);
        let cache = &mut *guard;

        self.tagger.tag(forms, &mut cache.sentence);
        if cache.sentence.size < forms.len() {
            return entities;
        }

        cache.sentence.clear_previous_stage();

        for stage in &self.stages {
            cache.sentence.clear_local_filled();
            self.templates
                .process_sentence(&mut cache.sentence, &mut cache.string_buffer, false);

            for i in 0..cache.sentence.size {
                if !cache.sentence.probabilities[i].local_filled {
                    cache.outcomes.resize(stage.outcomes(), 0.0);
                    stage.classify(
                        &cache.sentence.features[i],
                        &mut cache.outcomes,
                        &mut cache.hidden,
                    );
                    cache.sentence.probabilities[i].local =
                        local_probs_from_outcomes(&cache.outcomes, self.entities.len() as u32);
                    cache.sentence.probabilities[i].local_filled = true;
                }

                if i == 0 {
                    let local = cache.sentence.probabilities[0].local;
                    cache.sentence.probabilities[0].global.init(&local);
                } else {
                    let local = cache.sentence.probabilities[i].local;
                    let prev = cache.sentence.probabilities[i - 1].global;
                    cache.sentence.probabilities[i].global.update(&local, &prev);
                }
            }

            cache.sentence.compute_best_decoding();
            cache.sentence.fill_previous_stage();
        }

        extract_entities(&cache.sentence, &self.entities, &mut entities);
        self.templates
            .process_entities(&cache.sentence, &mut entities, &mut cache.entities_buffer);

        entities.sort_by(|a, b| a.start.cmp(&b.start).then(b.length.cmp(&a.length)));
        entities
    }

    /// All entity type names of the model, in id order.
    pub fn entity_types(&self) -> Vec<String> {
        self.entities.names().map(str::to_string).collect()
    }

    /// Configured gazetteer phrases; `types` receives the parallel entity
    /// ids when provided.
    pub fn gazetteers(&self, types: Option<&mut Vec<EntityId>>) -> Vec<String> {
        let mut phrases = Vec::new();
        self.templates.gazetteers(&mut phrases, types);
        phrases
    }

    /// A fresh tokeniser suitable for this model variant, when the variant's
    /// tokenisation lives inside this crate.
    pub fn new_tokenizer(&self) -> Option<Box<dyn Tokenizer>> {
        match self.variant {
            ModelVariant::Generic => Some(Box::new(WhitespaceTokenizer)),
            ModelVariant::Czech | ModelVariant::English => None,
        }
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }
}

/// Collapse a classifier outcome distribution into per-tag local
/// probabilities: `I`/`L`/`O` map directly, `B` and `U` take the arg-max
/// entity conditional on the tag.
pub(crate) fn local_probs_from_outcomes(outcomes: &[f64], entity_count: u32) -> LocalProbs {
    let at = |o: u32| outcomes.get(o as usize).copied().unwrap_or(0.0);

    let mut p = LocalProbs::default();
    p[BilouTag::I].probability = at(bilou::outcome_from(BilouTag::I, 0));
    p[BilouTag::L].probability = at(bilou::outcome_from(BilouTag::L, 0));
    p[BilouTag::O].probability = at(bilou::outcome_from(BilouTag::O, 0));

    if entity_count == 0 {
        return p;
    }

    p[BilouTag::B].probability = at(bilou::outcome_b(0));
    p[BilouTag::B].entity = 0;
    p[BilouTag::U].probability = at(bilou::outcome_u(0));
    p[BilouTag::U].entity = 0;
    for entity in 1..entity_count {
        let b = at(bilou::outcome_b(entity));
        if b > p[BilouTag::B].probability {
            p[BilouTag::B].probability = b;
            p[BilouTag::B].entity = entity;
        }
        let u = at(bilou::outcome_u(entity));
        if u > p[BilouTag::U].probability {
            p[BilouTag::U].probability = u;
            p[BilouTag::U].entity = entity;
        }
    }
    p
}

/// Scan the decoded tags left to right and emit spans.
///
/// A `U` emits a one-token span; a `B` opens a span that runs until the
/// first `L` or, defensively, until end of sentence when no `L` follows.
pub(crate) fn extract_entities(
    sentence: &Sentence,
    entities_map: &EntityMap,
    entities: &mut Vec<NamedEntity>,
) {
    entities.clear();
    let mut i = 0;
    while i < sentence.size {
        let global = &sentence.probabilities[i].global;
        if global.best == BilouTag::U {
            entities.push(NamedEntity::new(
                i,
                1,
                entities_map.name(global[BilouTag::U].entity),
            ));
        } else if global.best == BilouTag::B {
            let start = i;
            i += 1;
            while i < sentence.size && sentence.probabilities[i].global.best != BilouTag::L {
                i += 1;
            }
            let length = i - start + (i < sentence.size) as usize;
            entities.push(NamedEntity::new(
                start,
                length,
                entities_map.name(sentence.probabilities[start].global[BilouTag::B].entity),
            ));
        }
        i += 1;
    }
}
