//! Previous-stage labels fed forward as features of the next stage.

use std::sync::atomic::AtomicU32;

use crate::bilou::{ENTITY_UNKNOWN, EntityId};
use crate::codec::{self, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::features::processor::{FeatureProcessor, KeyMap, WindowKind, apply_in_range};
use crate::features::{Pipeline, TemplateResult};
use crate::sentence::Sentence;

/// Emits the decoded `(bilou, entity)` label of each token at positions
/// `[1, window]` to its right, so the next stage sees the labels of the
/// tokens preceding the one it classifies.
pub struct PreviousStage {
    keys: KeyMap,
}

impl PreviousStage {
    pub fn new() -> Self {
        PreviousStage {
            keys: KeyMap::new(WindowKind::RightOnly),
        }
    }
}

/// Compact integer encoding used in the label keys: hexadecimal digits,
/// lowest nibble first, `-` prefix for negative values, zero encodes as the
/// empty string.
fn append_encoded(buffer: &mut String, value: i64) {
    let mut value = value;
    if value < 0 {
        buffer.push('-');
        value = -value;
    }
    while value != 0 {
        buffer.push(char::from_digit((value & 0xf) as u32, 16).unwrap_or('0'));
        value >>= 4;
    }
}

fn encoded_entity(entity: EntityId) -> i64 {
    if entity == ENTITY_UNKNOWN {
        -1
    } else {
        entity as i64
    }
}

impl FeatureProcessor for PreviousStage {
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
            let Some(bilou) = sentence.previous_stage[i].bilou else {
                continue;
            };
            buffer.clear();
            append_encoded(buffer, bilou as i64);
            buffer.push(' ');
            append_encoded(buffer, encoded_entity(sentence.previous_stage[i].entity));

            let feature = self.keys.lookup(buffer, total);
            apply_in_range(sentence, i as isize, feature, 1, window);
        }
    }
}
