//! Numeric token classification into hour/minute/day/month/year/time buckets.

use std::sync::atomic::AtomicU32;

use crate::codec::{self, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::features::processor::{FeatureProcessor, KeyMap, WindowKind, apply_in_window};
use crate::features::{Pipeline, TemplateResult};
use crate::sentence::Sentence;

/// Emits fixed keys for tokens whose digit content can denote a time value:
/// `H` (hour), `M` (minute), `t` (clock time), `d` (day), `m` (month),
/// `y` (year).
pub struct NumericTimeValue {
    keys: KeyMap,
}

impl NumericTimeValue {
    pub fn new() -> Self {
        NumericTimeValue {
            keys: KeyMap::new(WindowKind::Symmetric),
        }
    }
}

impl FeatureProcessor for NumericTimeValue {
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
        let hour = self.keys.lookup("H", total);
        let minute = self.keys.lookup("M", total);
        let time = self.keys.lookup("t", total);
        let day = self.keys.lookup("d", total);
        let month = self.keys.lookup("m", total);
        let year = self.keys.lookup("y", total);

        for i in 0..sentence.size {
            let bytes = sentence.words[i].form.clone().into_bytes();

            let mut pos = 0;
            let mut num: u32 = 0;
            let mut digit = false;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                digit = true;
                num = num.wrapping_mul(10).wrapping_add((bytes[pos] - b'0') as u32);
                pos += 1;
            }

            if digit && pos == bytes.len() {
                // A bare number
                if num < 24 {
                    apply_in_window(sentence, i as isize, hour, window);
                }
                if num < 60 {
                    apply_in_window(sentence, i as isize, minute, window);
                }
                if (1..=31).contains(&num) {
                    apply_in_window(sentence, i as isize, day, window);
                }
                if (1..=12).contains(&num) {
                    apply_in_window(sentence, i as isize, month, window);
                }
                if (1000..=2200).contains(&num) {
                    apply_in_window(sentence, i as isize, year, window);
                }
            }
            if digit && num < 24 && pos < bytes.len() && (bytes[pos] == b'.' || bytes[pos] == b':') {
                // Maybe a clock time like 12:30 or 12.30
                pos += 1;
                num = 0;
                digit = false;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    digit = true;
                    num = num.wrapping_mul(10).wrapping_add((bytes[pos] - b'0') as u32);
                    pos += 1;
                }
                if digit && pos == bytes.len() && num < 60 {
                    apply_in_window(sentence, i as isize, time, window);
                }
            }
        }
    }
}
