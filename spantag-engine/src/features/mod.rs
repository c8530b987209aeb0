//! Feature templates: the DSL-driven registry of per-sentence feature
//! processors and entity post-processors.
//!
//! A template file has one template per line, `Name[/window] arg1 arg2 …`;
//! `#` starts a comment and blank lines are ignored. Each line instantiates
//! one processor looked up by name. The registry owns the model-wide
//! feature-id allocator: id 0 is the omnipresent feature every token
//! receives, and each template's keys claim contiguous id blocks above it.

mod clusters;
mod containers;
mod gazetteers;
mod lexical;
mod numeric;
mod processor;
mod stage;
mod url;

use std::io::BufRead;
use std::sync::atomic::{AtomicU32, Ordering};

pub use processor::{
    FeatureProcessor, KeyMap, WindowKind, apply_in_range, apply_in_window,
    apply_outer_words_in_window,
};

use crate::bilou::EntityId;
use crate::codec::{self, CodecError, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::sentence::{NamedEntity, Sentence};
use crate::tagger::{Tagger, Tokenizer};

/// Sparse feature id; id 0 is the omnipresent feature.
pub type Feature = u32;

/// External collaborators needed to build gazetteer tries: gazetteer phrases
/// are tokenised and tagged the same way sentences are.
pub struct Pipeline<'a> {
    pub tokenizer: &'a dyn Tokenizer,
    pub tagger: &'a dyn Tagger,
}

/// Errors raised while parsing a template file.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid feature template: {0}")]
    Parse(String),
}

pub type TemplateResult<T> = std::result::Result<T, TemplateError>;

fn create_processor(name: &str) -> Option<Box<dyn FeatureProcessor>> {
    use lexical::{SuffixCasing, SuffixSource};

    Some(match name {
        "BrownClusters" => Box::new(clusters::BrownClusters::new()),
        "CzechAddContainers" => Box::new(containers::CzechAddContainers::new()),
        "CzechLemmaTerm" => Box::new(lexical::CzechLemmaTerm::new()),
        "Form" => Box::new(lexical::Form::new()),
        "FormCapitalization" => Box::new(lexical::Capitalization::forms()),
        "FormCaseNormalized" => Box::new(lexical::CaseNormalized::forms()),
        "FormCaseNormalizedSuffix" => Box::new(lexical::Suffix::new(
            SuffixSource::Form,
            SuffixCasing::Normalized,
        )),
        "FormSuffix" => Box::new(lexical::Suffix::new(
            SuffixSource::Form,
            SuffixCasing::Original,
        )),
        "Gazetteers" => Box::new(gazetteers::Gazetteers::new()),
        "GazetteersEnhanced" => Box::new(gazetteers::GazetteersEnhanced::new()),
        "Lemma" => Box::new(lexical::Lemma::new()),
        "NumericTimeValue" => Box::new(numeric::NumericTimeValue::new()),
        "PreviousStage" => Box::new(stage::PreviousStage::new()),
        "RawLemma" => Box::new(lexical::RawLemma::new()),
        "RawLemmaCapitalization" => Box::new(lexical::Capitalization::raw_lemmas()),
        "RawLemmaCaseNormalized" => Box::new(lexical::CaseNormalized::raw_lemmas()),
        "RawLemmaCaseNormalizedSuffix" => Box::new(lexical::Suffix::new(
            SuffixSource::RawLemma,
            SuffixCasing::Normalized,
        )),
        "RawLemmaSuffix" => Box::new(lexical::Suffix::new(
            SuffixSource::RawLemma,
            SuffixCasing::Original,
        )),
        "Tag" => Box::new(lexical::Tag::new()),
        "URLEmailDetector" => Box::new(url::UrlEmailDetector::new()),
        _ => return None,
    })
}

/// The ordered template set owned by the engine.
pub struct FeatureTemplates {
    total_features: AtomicU32,
    processors: Vec<(String, Box<dyn FeatureProcessor>)>,
}

impl std::fmt::Debug for FeatureTemplates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureTemplates")
            .field("total_features", &self.total_features)
            .field(
                "processors",
                &self.processors.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for FeatureTemplates {
    fn default() -> Self {
        FeatureTemplates {
            // Id 0 is the omnipresent feature
            total_features: AtomicU32::new(1),
            processors: Vec::new(),
        }
    }
}

impl FeatureTemplates {
    /// Parse a template file, instantiating one processor per line.
    pub fn parse(
        input: impl BufRead,
        entities: &mut EntityMap,
        pipeline: &Pipeline,
    ) -> TemplateResult<Self> {
        let mut templates = FeatureTemplates::default();

        for line in input.lines() {
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split(' ').filter(|t| !t.is_empty());
            let Some(head) = tokens.next() else { continue };

            let (name, window) = match head.split_once('/') {
                None => (head, 0),
                Some((name, window)) => {
                    let window: i32 = window.parse().map_err(|_| {
                        TemplateError::Parse(format!(
                            "bad template window at line '{line}' of feature templates file"
                        ))
                    })?;
                    if window < 0 {
                        return Err(TemplateError::Parse(format!(
                            "negative template window at line '{line}' of feature templates file"
                        )));
                    }
                    (name, window)
                }
            };
            let args: Vec<String> = tokens.map(str::to_string).collect();

            let Some(mut processor) = create_processor(name) else {
                return Err(TemplateError::Parse(format!(
                    "cannot create feature template '{name}' from line '{line}' of feature templates file"
                )));
            };
            processor
                .parse(window, &args, entities, &templates.total_features, pipeline)
                .map_err(|e| {
                    TemplateError::Parse(format!(
                        "cannot initialize feature template '{name}' from line '{line}' of feature templates file: {e}"
                    ))
                })?;
            templates.processors.push((name.to_string(), processor));
        }

        Ok(templates)
    }

    pub fn load(r: &mut Reader, pipeline: &Pipeline) -> codec::Result<Self> {
        let total_features = r.next_u32()?;

        let count = r.next_u32()? as usize;
        let mut processors = Vec::with_capacity(count);
        for _ in 0..count {
            let name = r.next_str()?;
            let Some(mut processor) = create_processor(&name) else {
                return Err(CodecError::Format(format!(
                    "unknown feature template '{name}' in model"
                )));
            };
            processor.load(r, pipeline)?;
            processors.push((name, processor));
        }

        Ok(FeatureTemplates {
            total_features: AtomicU32::new(total_features),
            processors,
        })
    }

    pub fn save(&self, w: &mut Writer) {
        w.put_u32(self.total_features());
        w.put_u32(self.processors.len() as u32);
        for (name, processor) in &self.processors {
            w.put_str(name);
            processor.save(w);
        }
    }

    /// Extract features for every token of the sentence.
    ///
    /// Feature lists are reset to the omnipresent id 0 first. With
    /// `adding_features` set (training), unknown keys claim fresh ids.
    pub fn process_sentence(
        &self,
        sentence: &mut Sentence,
        buffer: &mut String,
        adding_features: bool,
    ) {
        for i in 0..sentence.size {
            sentence.features[i].clear();
            sentence.features[i].push(0);
        }

        let total = adding_features.then_some(&self.total_features);
        for (_, processor) in &self.processors {
            processor.process_sentence(sentence, total, buffer);
        }
    }

    /// Run entity post-processors in registration order.
    pub fn process_entities(
        &self,
        sentence: &Sentence,
        entities: &mut Vec<NamedEntity>,
        buffer: &mut Vec<NamedEntity>,
    ) {
        for (_, processor) in &self.processors {
            processor.process_entities(sentence, entities, buffer);
        }
    }

    /// Aggregate gazetteer phrases (and optionally their entity ids) from
    /// all configured gazetteer templates.
    pub fn gazetteers(&self, phrases: &mut Vec<String>, mut entities: Option<&mut Vec<EntityId>>) {
        for (_, processor) in &self.processors {
            processor.gazetteers(phrases, entities.as_deref_mut());
        }
    }

    pub fn total_features(&self) -> Feature {
        self.total_features.load(Ordering::Relaxed)
    }
}
