//! URL and e-mail token detection.
//!
//! Detected tokens bypass the classifier entirely: their local probabilities
//! are overwritten with a one-hot unit-entity distribution before
//! classification runs.

use std::sync::atomic::AtomicU32;

use regex::Regex;

use crate::bilou::{BilouTag, EntityId, LocalProbs};
use crate::codec::{self, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::features::processor::{FeatureProcessor, KeyMap, WindowKind};
use crate::features::{Pipeline, TemplateError, TemplateResult};
use crate::sentence::Sentence;

const EMAIL_PATTERN: &str = r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$";
const URL_PATTERN: &str = r"(?x)^(?:
    [A-Za-z][A-Za-z0-9+.-]*://\S+                                  # scheme://…
  | www\.[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)+(?:/\S*)?                # www.…
  | [A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.(?:com|org|net|edu|gov|int|info|biz|eu|cz|sk|uk|de|fr)(?:/\S*)?
)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detected {
    Url,
    Email,
}

/// Overrides local probabilities of URL/e-mail tokens with a one-hot `U`
/// at the configured entity.
pub struct UrlEmailDetector {
    keys: KeyMap,
    url: EntityId,
    email: EntityId,
    url_re: Regex,
    email_re: Regex,
}

impl UrlEmailDetector {
    pub fn new() -> Self {
        UrlEmailDetector {
            keys: KeyMap::new(WindowKind::Symmetric),
            url: 0,
            email: 0,
            // The patterns are compile-time constants
            url_re: Regex::new(URL_PATTERN).expect("invalid URL pattern"),
            email_re: Regex::new(EMAIL_PATTERN).expect("invalid e-mail pattern"),
        }
    }

    fn detect(&self, form: &str) -> Option<Detected> {
        if self.email_re.is_match(form) {
            Some(Detected::Email)
        } else if self.url_re.is_match(form) {
            Some(Detected::Url)
        } else {
            None
        }
    }
}

impl FeatureProcessor for UrlEmailDetector {
    fn parse(
        &mut self,
        window: i32,
        args: &[String],
        entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        if args.len() != 2 {
            return Err(TemplateError::Parse(
                "URLEmailDetector requires exactly two arguments, entity types for URL and e-mail"
                    .to_string(),
            ));
        }
        self.url = entities.parse_or_add(&args[0]);
        self.email = entities.parse_or_add(&args[1]);
        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)?;
        self.url = r.next_u32()?;
        self.email = r.next_u32()?;
        Ok(())
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);
        w.put_u32(self.url);
        w.put_u32(self.email);
    }

    fn process_sentence(&self, sentence: &mut Sentence, _total: Option<&AtomicU32>, _buffer: &mut String) {
        for i in 0..sentence.size {
            if sentence.probabilities[i].local_filled {
                continue;
            }
            let Some(detected) = self.detect(&sentence.words[i].form) else {
                continue;
            };

            let probs = &mut sentence.probabilities[i];
            probs.local = LocalProbs::default();
            probs.local[BilouTag::U].probability = 1.0;
            probs.local[BilouTag::U].entity = match detected {
                Detected::Url => self.url,
                Detected::Email => self.email,
            };
            probs.local_filled = true;
        }
    }
}
