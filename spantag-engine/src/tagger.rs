//! Morphological tagging and tokenisation interfaces.
//!
//! The engine consumes a tagger through the [`Tagger`] trait; real
//! morphological analysis lives outside this crate. Two implementations are
//! provided: [`TrivialTagger`] copies the form into all lemma fields, and
//! [`ExternalTagger`] parses pre-tagged `form\trawlemma\ttag` tokens
//! produced by an external pipeline.

use std::io::{Read, Write};
use std::ops::Range;

use crate::codec::{CodecError, Result};
use crate::sentence::Sentence;

/// Fills a scratch sentence with tagged tokens for the given forms.
pub trait Tagger: Send + Sync {
    fn tag(&self, forms: &[&str], sentence: &mut Sentence);
}

/// The tagger implementations the model stream can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaggerKind {
    Trivial = 0,
    External = 1,
}

impl TaggerKind {
    /// Parse a tagger name as used in training configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "trivial" => Some(TaggerKind::Trivial),
            "external" => Some(TaggerKind::External),
            _ => None,
        }
    }

    pub fn create(self) -> Box<dyn Tagger> {
        match self {
            TaggerKind::Trivial => Box::new(TrivialTagger),
            TaggerKind::External => Box::new(ExternalTagger),
        }
    }

    /// Read the tagger id byte from the model stream and instantiate it.
    pub fn load(input: &mut dyn Read) -> Result<(Self, Box<dyn Tagger>)> {
        let mut id = [0u8; 1];
        input.read_exact(&mut id).map_err(|_| CodecError::Truncated)?;
        let kind = match id[0] {
            0 => TaggerKind::Trivial,
            1 => TaggerKind::External,
            other => {
                return Err(CodecError::Format(format!("unknown tagger id {other}")));
            }
        };
        Ok((kind, kind.create()))
    }

    /// Write the tagger id byte to the model stream.
    pub fn save(self, out: &mut dyn Write) -> Result<()> {
        out.write_all(&[self as u8])?;
        Ok(())
    }
}

fn reset_word(sentence: &mut Sentence, i: usize) {
    let word = &mut sentence.words[i];
    word.form.clear();
    word.raw_lemma.clear();
    word.raw_lemmas_all.clear();
    word.lemma_id.clear();
    word.lemma_comments.clear();
    word.tag.clear();
}

/// Uses the form itself as its lemma; no tag.
pub struct TrivialTagger;

impl Tagger for TrivialTagger {
    fn tag(&self, forms: &[&str], sentence: &mut Sentence) {
        sentence.resize(forms.len());
        for (i, form) in forms.iter().enumerate() {
            reset_word(sentence, i);
            let word = &mut sentence.words[i];
            word.form.push_str(form);
            word.raw_lemma.push_str(form);
            word.lemma_id.push_str(form);
            word.raw_lemmas_all.push(form.to_string());
        }
    }
}

/// Parses externally supplied analyses out of tab-separated forms.
///
/// Each incoming form may carry up to three tab-separated fields:
/// `form`, `raw_lemma` and `tag`. Missing fields degrade gracefully
/// (the raw lemma defaults to the form, the tag to empty).
pub struct ExternalTagger;

impl Tagger for ExternalTagger {
    fn tag(&self, forms: &[&str], sentence: &mut Sentence) {
        sentence.resize(forms.len());
        for (i, form) in forms.iter().enumerate() {
            reset_word(sentence, i);
            let mut fields = form.splitn(3, '\t');
            let word = &mut sentence.words[i];
            word.form.push_str(fields.next().unwrap_or(""));
            match fields.next() {
                Some(raw_lemma) => {
                    word.raw_lemma.push_str(raw_lemma);
                    word.tag.push_str(fields.next().unwrap_or(""));
                }
                None => word.raw_lemma.push_str(&word.form),
            }
            word.lemma_id.push_str(&word.raw_lemma);
            word.raw_lemmas_all.push(word.raw_lemma.clone());
        }
    }
}

/// Splits raw text into sentences of token byte ranges.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<Vec<Range<usize>>>;
}

/// Whitespace tokenisation: newlines separate sentences, other whitespace
/// separates tokens. Used for generic models and for gazetteer phrases.
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Vec<Range<usize>>> {
        let mut sentences = Vec::new();
        let mut offset = 0;
        for line in text.split('\n') {
            let mut tokens = Vec::new();
            let mut start = None;
            for (i, c) in line.char_indices() {
                if c.is_whitespace() {
                    if let Some(s) = start.take() {
                        tokens.push(offset + s..offset + i);
                    }
                } else if start.is_none() {
                    start = Some(i);
                }
            }
            if let Some(s) = start {
                tokens.push(offset + s..offset + line.len());
            }
            if !tokens.is_empty() {
                sentences.push(tokens);
            }
            offset += line.len() + 1;
        }
        sentences
    }
}
