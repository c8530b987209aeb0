//! Lexical feature templates keyed off token forms, lemmas and tags.

use std::sync::atomic::AtomicU32;

use crate::codec::{self, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::features::processor::{
    FeatureProcessor, KeyMap, WindowKind, apply_in_window, apply_outer_words_in_window,
};
use crate::features::{Pipeline, TemplateError, TemplateResult};
use crate::sentence::Sentence;

/// Key = the raw token form. Out-of-sentence positions are padded with the
/// empty key.
pub struct Form {
    keys: KeyMap,
}

impl Form {
    pub fn new() -> Self {
        Form {
            keys: KeyMap::new(WindowKind::Symmetric),
        }
    }
}

impl FeatureProcessor for Form {
    fn parse(
        &mut self,
        window: i32,
        _args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);
    }

    fn process_sentence(&self, sentence: &mut Sentence, total: Option<&AtomicU32>, _buffer: &mut String) {
        let window = self.keys.window();
        for i in 0..sentence.size {
            let feature = self.keys.lookup(&sentence.words[i].form, total);
            apply_in_window(sentence, i as isize, feature, window);
        }
        apply_outer_words_in_window(sentence, self.keys.get(""), window);
    }
}

/// Key = the raw lemma; otherwise identical to [`Form`].
pub struct RawLemma {
    keys: KeyMap,
}

impl RawLemma {
    pub fn new() -> Self {
        RawLemma {
            keys: KeyMap::new(WindowKind::Symmetric),
        }
    }
}

impl FeatureProcessor for RawLemma {
    fn parse(
        &mut self,
        window: i32,
        _args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);
    }

    fn process_sentence(&self, sentence: &mut Sentence, total: Option<&AtomicU32>, _buffer: &mut String) {
        let window = self.keys.window();
        for i in 0..sentence.size {
            let feature = self.keys.lookup(&sentence.words[i].raw_lemma, total);
            apply_in_window(sentence, i as isize, feature, window);
        }
        apply_outer_words_in_window(sentence, self.keys.get(""), window);
    }
}

/// Key = the disambiguated lemma id.
pub struct Lemma {
    keys: KeyMap,
}

impl Lemma {
    pub fn new() -> Self {
        Lemma {
            keys: KeyMap::new(WindowKind::Symmetric),
        }
    }
}

impl FeatureProcessor for Lemma {
    fn parse(
        &mut self,
        window: i32,
        _args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);
    }

    fn process_sentence(&self, sentence: &mut Sentence, total: Option<&AtomicU32>, _buffer: &mut String) {
        let window = self.keys.window();
        for i in 0..sentence.size {
            let feature = self.keys.lookup(&sentence.words[i].lemma_id, total);
            apply_in_window(sentence, i as isize, feature, window);
        }
        apply_outer_words_in_window(sentence, self.keys.get(""), window);
    }
}

/// Key = the morphological tag.
pub struct Tag {
    keys: KeyMap,
}

impl Tag {
    pub fn new() -> Self {
        Tag {
            keys: KeyMap::new(WindowKind::Symmetric),
        }
    }
}

impl FeatureProcessor for Tag {
    fn parse(
        &mut self,
        window: i32,
        _args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);
    }

    fn process_sentence(&self, sentence: &mut Sentence, total: Option<&AtomicU32>, _buffer: &mut String) {
        let window = self.keys.window();
        for i in 0..sentence.size {
            let feature = self.keys.lookup(&sentence.words[i].tag, total);
            apply_in_window(sentence, i as isize, feature, window);
        }
        apply_outer_words_in_window(sentence, self.keys.get(""), window);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TextSource {
    Form,
    RawLemma,
}

fn source_text<'a>(sentence: &'a Sentence, i: usize, source: TextSource) -> &'a str {
    match source {
        TextSource::Form => &sentence.words[i].form,
        TextSource::RawLemma => &sentence.words[i].raw_lemma,
    }
}

/// Three fixed keys: `f` (first-cap), `a` (all-cap), `m` (mixed-cap).
pub struct Capitalization {
    keys: KeyMap,
    source: TextSource,
}

impl Capitalization {
    pub fn forms() -> Self {
        Capitalization {
            keys: KeyMap::new(WindowKind::Symmetric),
            source: TextSource::Form,
        }
    }

    pub fn raw_lemmas() -> Self {
        Capitalization {
            keys: KeyMap::new(WindowKind::Symmetric),
            source: TextSource::RawLemma,
        }
    }
}

impl FeatureProcessor for Capitalization {
    fn parse(
        &mut self,
        window: i32,
        _args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);
    }

    fn process_sentence(&self, sentence: &mut Sentence, total: Option<&AtomicU32>, _buffer: &mut String) {
        let window = self.keys.window();
        let fst_cap = self.keys.lookup("f", total);
        let all_cap = self.keys.lookup("a", total);
        let mixed_cap = self.keys.lookup("m", total);

        for i in 0..sentence.size {
            let mut was_upper = false;
            let mut was_lower = false;
            let mut first_upper = false;
            for (k, chr) in source_text(sentence, i, self.source).chars().enumerate() {
                was_upper = was_upper || chr.is_uppercase();
                was_lower = was_lower || chr.is_lowercase();
                if k == 0 {
                    first_upper = was_upper;
                }
            }

            if first_upper {
                apply_in_window(sentence, i as isize, fst_cap, window);
            }
            if was_upper && !was_lower {
                apply_in_window(sentence, i as isize, all_cap, window);
            }
            if was_upper && was_lower {
                apply_in_window(sentence, i as isize, mixed_cap, window);
            }
        }
    }
}

/// Key = the text lowercased after its first codepoint.
pub struct CaseNormalized {
    keys: KeyMap,
    source: TextSource,
}

impl CaseNormalized {
    pub fn forms() -> Self {
        CaseNormalized {
            keys: KeyMap::new(WindowKind::Symmetric),
            source: TextSource::Form,
        }
    }

    pub fn raw_lemmas() -> Self {
        CaseNormalized {
            keys: KeyMap::new(WindowKind::Symmetric),
            source: TextSource::RawLemma,
        }
    }
}

impl FeatureProcessor for CaseNormalized {
    fn parse(
        &mut self,
        window: i32,
        _args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);
    }

    fn process_sentence(&self, sentence: &mut Sentence, total: Option<&AtomicU32>, buffer: &mut String) {
        let window = self.keys.window();
        for i in 0..sentence.size {
            buffer.clear();
            for chr in source_text(sentence, i, self.source).chars() {
                if buffer.is_empty() {
                    buffer.push(chr);
                } else {
                    buffer.extend(chr.to_lowercase());
                }
            }
            let feature = self.keys.lookup(buffer, total);
            apply_in_window(sentence, i as isize, feature, window);
        }
        apply_outer_words_in_window(sentence, self.keys.get(""), window);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SuffixSource {
    Form,
    RawLemma,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SuffixCasing {
    Original,
    Normalized,
}

/// One key per suffix length in `shortest..=longest` codepoints, optionally
/// case-normalised like [`CaseNormalized`].
pub struct Suffix {
    keys: KeyMap,
    shortest: u32,
    longest: u32,
    source: SuffixSource,
    casing: SuffixCasing,
}

impl Suffix {
    pub fn new(source: SuffixSource, casing: SuffixCasing) -> Self {
        Suffix {
            keys: KeyMap::new(WindowKind::Symmetric),
            shortest: 0,
            longest: 0,
            source,
            casing,
        }
    }
}

impl FeatureProcessor for Suffix {
    fn parse(
        &mut self,
        window: i32,
        args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        if args.len() != 2 {
            return Err(TemplateError::Parse(
                "suffix templates require exactly two arguments, shortest and longest suffix length"
                    .to_string(),
            ));
        }
        self.shortest = args[0]
            .parse()
            .map_err(|_| TemplateError::Parse(format!("bad shortest suffix length '{}'", args[0])))?;
        self.longest = args[1]
            .parse()
            .map_err(|_| TemplateError::Parse(format!("bad longest suffix length '{}'", args[1])))?;
        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)?;
        self.shortest = r.next_u32()?;
        self.longest = r.next_u32()?;
        Ok(())
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);
        w.put_u32(self.shortest);
        w.put_u32(self.longest);
    }

    fn process_sentence(&self, sentence: &mut Sentence, total: Option<&AtomicU32>, buffer: &mut String) {
        let window = self.keys.window();
        let mut chrs: Vec<char> = Vec::new();

        for i in 0..sentence.size {
            chrs.clear();
            let text = match self.source {
                SuffixSource::Form => &sentence.words[i].form,
                SuffixSource::RawLemma => &sentence.words[i].raw_lemma,
            };
            for chr in text.chars() {
                if self.casing == SuffixCasing::Original || chrs.is_empty() {
                    chrs.push(chr);
                } else {
                    chrs.extend(chr.to_lowercase());
                }
            }

            // Keys accumulate the suffix back to front, one length at a time
            buffer.clear();
            let mut s = 1;
            while s <= self.longest && s as usize <= chrs.len() {
                buffer.push(chrs[chrs.len() - s as usize]);
                if s >= self.shortest {
                    let feature = self.keys.lookup(buffer, total);
                    apply_in_window(sentence, i as isize, feature, window);
                }
                s += 1;
            }
        }

        apply_outer_words_in_window(sentence, self.keys.get(""), window);
    }
}

/// One key per `_;X` term marker in the lemma comments, keyed by the single
/// character `X`.
pub struct CzechLemmaTerm {
    keys: KeyMap,
}

impl CzechLemmaTerm {
    pub fn new() -> Self {
        CzechLemmaTerm {
            keys: KeyMap::new(WindowKind::Symmetric),
        }
    }
}

impl FeatureProcessor for CzechLemmaTerm {
    fn parse(
        &mut self,
        window: i32,
        _args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);
    }

    fn process_sentence(&self, sentence: &mut Sentence, total: Option<&AtomicU32>, buffer: &mut String) {
        let window = self.keys.window();
        for i in 0..sentence.size {
            let comments = sentence.words[i].lemma_comments.clone();
            let bytes = comments.as_bytes();
            for pos in 0..bytes.len().saturating_sub(2) {
                if bytes[pos] == b'_' && bytes[pos + 1] == b';' {
                    if let Some(term) = comments[pos + 2..].chars().next() {
                        buffer.clear();
                        buffer.push(term);
                        let feature = self.keys.lookup(buffer, total);
                        apply_in_window(sentence, i as isize, feature, window);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagger::{Tagger as _, TrivialTagger, WhitespaceTokenizer};

    fn run(processor: &mut dyn FeatureProcessor, window: i32, args: &[&str], forms: &[&str]) -> Sentence {
        let tokenizer = WhitespaceTokenizer;
        let tagger = TrivialTagger;
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: &tagger,
        };
        let mut entities = EntityMap::new();
        let total = AtomicU32::new(1);
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        processor
            .parse(window, &args, &mut entities, &total, &pipeline)
            .unwrap();

        let mut sentence = Sentence::new();
        TrivialTagger.tag(forms, &mut sentence);
        for i in 0..sentence.size {
            sentence.features[i].clear();
        }
        let mut buffer = String::new();
        processor.process_sentence(&mut sentence, Some(&total), &mut buffer);
        sentence
    }

    #[test]
    fn test_form_same_key_same_feature() {
        let mut processor = Form::new();
        let sentence = run(&mut processor, 0, &[], &["to", "be", "to"]);
        assert_eq!(sentence.features[0], sentence.features[2]);
        assert_ne!(sentence.features[0], sentence.features[1]);
    }

    #[test]
    fn test_form_window_emission() {
        let mut processor = Form::new();
        let sentence = run(&mut processor, 1, &[], &["a", "b"]);
        // Every token sees its own key, its neighbour's key at offset ±1,
        // and the boundary padding
        assert!(sentence.features[0].len() >= 3);
        assert!(sentence.features[1].len() >= 3);
    }

    #[test]
    fn test_capitalization_keys() {
        let mut processor = Capitalization::forms();
        let sentence = run(&mut processor, 0, &[], &["Paris", "NATO", "iPhone", "none"]);
        // Paris: first-cap + mixed; NATO: first-cap + all-cap;
        // iPhone: mixed only; none: nothing
        assert_eq!(sentence.features[0].len(), 2);
        assert_eq!(sentence.features[1].len(), 2);
        assert_eq!(sentence.features[2].len(), 1);
        assert!(sentence.features[3].is_empty());
    }

    #[test]
    fn test_case_normalized_merges_casings() {
        let mut processor = CaseNormalized::forms();
        let sentence = run(&mut processor, 0, &[], &["PAris", "PAris", "Paris"]);
        // Lowercasing after the first codepoint maps both spellings together
        assert_eq!(sentence.features[0], sentence.features[1]);
        assert_eq!(sentence.features[0], sentence.features[2]);
    }

    #[test]
    fn test_suffix_lengths() {
        let mut processor = Suffix::new(SuffixSource::Form, SuffixCasing::Original);
        let sentence = run(&mut processor, 0, &["2", "3"], &["walking", "king"]);
        // Suffix lengths 2 and 3 produce two features per token; "ng"/"ing"
        // are shared between the two forms
        assert_eq!(sentence.features[0].len(), 2);
        assert_eq!(sentence.features[0], sentence.features[1]);
    }

    #[test]
    fn test_suffix_requires_two_args() {
        let tokenizer = WhitespaceTokenizer;
        let tagger = TrivialTagger;
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: &tagger,
        };
        let mut entities = EntityMap::new();
        let total = AtomicU32::new(1);
        let mut processor = Suffix::new(SuffixSource::Form, SuffixCasing::Original);
        assert!(
            processor
                .parse(0, &["2".to_string()], &mut entities, &total, &pipeline)
                .is_err()
        );
    }

    #[test]
    fn test_czech_lemma_term() {
        let tokenizer = WhitespaceTokenizer;
        let tagger = TrivialTagger;
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: &tagger,
        };
        let mut entities = EntityMap::new();
        let total = AtomicU32::new(1);
        let mut processor = CzechLemmaTerm::new();
        processor.parse(0, &[], &mut entities, &total, &pipeline).unwrap();

        let mut sentence = Sentence::new();
        TrivialTagger.tag(&["Praha"], &mut sentence);
        sentence.words[0].lemma_comments = "_;G_;K".to_string();
        sentence.features[0].clear();
        let mut buffer = String::new();
        processor.process_sentence(&mut sentence, Some(&total), &mut buffer);
        // Two term markers, two features
        assert_eq!(sentence.features[0].len(), 2);
    }

    #[test]
    fn test_unseen_key_emits_nothing_when_frozen() {
        let mut processor = Form::new();
        let tokenizer = WhitespaceTokenizer;
        let tagger = TrivialTagger;
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: &tagger,
        };
        let mut entities = EntityMap::new();
        let total = AtomicU32::new(1);
        processor.parse(0, &[], &mut entities, &total, &pipeline).unwrap();

        let mut sentence = Sentence::new();
        TrivialTagger.tag(&["unseen"], &mut sentence);
        sentence.features[0].clear();
        let mut buffer = String::new();
        processor.process_sentence(&mut sentence, None, &mut buffer);
        assert!(sentence.features[0].is_empty());
    }
}
