//! Tagged sentence scratch used throughout a recognition call.
//!
//! The sentence keeps `size` valid entries in four parallel sequences whose
//! capacity is retained across calls, so a pooled scratch sentence can be
//! reused without reallocation.

use crate::bilou::{BilouTag, ENTITY_UNKNOWN, EntityId, GlobalProbs, LocalProbs};
use crate::features::Feature;

/// A recognised entity span over sentence tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedEntity {
    /// Index of the first token.
    pub start: usize,
    /// Number of tokens covered, at least 1.
    pub length: usize,
    /// Entity type name from the model's entity vocabulary.
    pub entity_type: String,
}

impl NamedEntity {
    pub fn new(start: usize, length: usize, entity_type: impl Into<String>) -> Self {
        NamedEntity {
            start,
            length,
            entity_type: entity_type.into(),
        }
    }
}

/// One token as produced by the tagger.
#[derive(Debug, Clone, Default)]
pub struct TaggedWord {
    pub form: String,
    pub raw_lemma: String,
    /// Alternative raw lemmas, deduplicated, first one equal to `raw_lemma`.
    pub raw_lemmas_all: Vec<String>,
    pub lemma_id: String,
    pub lemma_comments: String,
    pub tag: String,
}

/// Per-token classification state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbabilityInfo {
    pub local: LocalProbs,
    pub local_filled: bool,
    pub global: GlobalProbs,
}

/// Decoded label of the previous stage, fed as features to the next one.
#[derive(Debug, Clone, Copy)]
pub struct PreviousStage {
    pub bilou: Option<BilouTag>,
    pub entity: EntityId,
}

impl Default for PreviousStage {
    fn default() -> Self {
        PreviousStage {
            bilou: None,
            entity: ENTITY_UNKNOWN,
        }
    }
}

#[derive(Debug, Default)]
pub struct Sentence {
    pub size: usize,
    pub words: Vec<TaggedWord>,
    pub features: Vec<Vec<Feature>>,
    pub probabilities: Vec<ProbabilityInfo>,
    pub previous_stage: Vec<PreviousStage>,
}

impl Sentence {
    pub fn new() -> Self {
        Sentence::default()
    }

    /// Set the logical size, growing the parallel sequences as needed.
    /// Existing capacity is never released.
    pub fn resize(&mut self, size: usize) {
        self.size = size;
        if self.words.len() < size {
            self.words.resize_with(size, TaggedWord::default);
        }
        if self.features.len() < size {
            self.features.resize_with(size, Vec::new);
        }
        if self.probabilities.len() < size {
            self.probabilities.resize_with(size, ProbabilityInfo::default);
        }
        if self.previous_stage.len() < size {
            self.previous_stage.resize_with(size, PreviousStage::default);
        }
    }

    pub fn clear_features(&mut self) {
        for i in 0..self.size {
            self.features[i].clear();
        }
    }

    pub fn clear_local_filled(&mut self) {
        for i in 0..self.size {
            self.probabilities[i].local_filled = false;
        }
    }

    pub fn clear_previous_stage(&mut self) {
        for i in 0..self.size {
            self.previous_stage[i] = PreviousStage::default();
        }
    }

    /// Back-trace the best path after all tokens were updated.
    ///
    /// The last token is constrained to `{L, O, U}` (an entity cannot be
    /// left open); `previous` pointers then propagate the choice back to
    /// position 0, storing the decoded tag in each token's `global.best`.
    pub fn compute_best_decoding(&mut self) {
        if self.size == 0 {
            return;
        }

        let mut best = BilouTag::L;
        let last = &self.probabilities[self.size - 1].global;
        if last[BilouTag::O].probability > last[best].probability {
            best = BilouTag::O;
        }
        if last[BilouTag::U].probability > last[best].probability {
            best = BilouTag::U;
        }
        self.probabilities[self.size - 1].global.best = best;

        for i in (1..self.size).rev() {
            best = self.probabilities[i].global.previous[best.index()].unwrap_or(BilouTag::O);
            self.probabilities[i - 1].global.best = best;
        }
    }

    /// Materialise the decoded labels into `previous_stage`.
    pub fn fill_previous_stage(&mut self) {
        for i in 0..self.size {
            let global = &self.probabilities[i].global;
            self.previous_stage[i] = PreviousStage {
                bilou: Some(global.best),
                entity: global[global.best].entity,
            };
        }
    }
}
