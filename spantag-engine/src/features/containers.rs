//! Container entities composed from contiguous primitive entities.

use std::sync::atomic::AtomicU32;

use crate::codec::{self, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::features::processor::FeatureProcessor;
use crate::features::{Pipeline, TemplateError, TemplateResult};
use crate::sentence::{NamedEntity, Sentence};

/// Czech container composition: a run of `pf` entities followed by a run of
/// `ps` entities forms a person container `P`; `td tm [ty]` and `tm ty`
/// sequences form a time container `T`. Primitive entities are always kept;
/// containers are added on top.
pub struct CzechAddContainers;

impl CzechAddContainers {
    pub fn new() -> Self {
        CzechAddContainers
    }
}

fn contiguous(entities: &[NamedEntity], j: usize) -> bool {
    entities[j].start == entities[j - 1].start + entities[j - 1].length
}

impl FeatureProcessor for CzechAddContainers {
    fn parse(
        &mut self,
        window: i32,
        _args: &[String],
        _entities: &mut EntityMap,
        _total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        if window != 0 {
            return Err(TemplateError::Parse(
                "CzechAddContainers cannot have a non-zero window".to_string(),
            ));
        }
        Ok(())
    }

    fn load(&mut self, _r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        Ok(())
    }

    fn save(&self, _w: &mut Writer) {}

    fn process_sentence(&self, _sentence: &mut Sentence, _total: Option<&AtomicU32>, _buffer: &mut String) {}

    fn process_entities(
        &self,
        _sentence: &Sentence,
        entities: &mut Vec<NamedEntity>,
        buffer: &mut Vec<NamedEntity>,
    ) {
        buffer.clear();

        for i in 0..entities.len() {
            // P from a pf+ run followed by a ps+ run
            if entities[i].entity_type == "pf"
                && (i == 0 || !contiguous(entities, i) || entities[i - 1].entity_type != "pf")
            {
                let mut j = i + 1;
                while j < entities.len() && contiguous(entities, j) && entities[j].entity_type == "pf"
                {
                    j += 1;
                }
                if j < entities.len() && contiguous(entities, j) && entities[j].entity_type == "ps" {
                    j += 1;
                    while j < entities.len()
                        && contiguous(entities, j)
                        && entities[j].entity_type == "ps"
                    {
                        j += 1;
                    }
                    buffer.push(NamedEntity::new(
                        entities[i].start,
                        entities[j - 1].start + entities[j - 1].length - entities[i].start,
                        "P",
                    ));
                }
            }

            // T from td tm [ty]
            if entities[i].entity_type == "td"
                && i + 1 < entities.len()
                && contiguous(entities, i + 1)
                && entities[i + 1].entity_type == "tm"
            {
                let mut j = i + 2;
                if j < entities.len() && contiguous(entities, j) && entities[j].entity_type == "ty" {
                    j += 1;
                }
                buffer.push(NamedEntity::new(
                    entities[i].start,
                    entities[j - 1].start + entities[j - 1].length - entities[i].start,
                    "T",
                ));
            }
            // T from tm ty without a preceding td
            if entities[i].entity_type == "tm"
                && (i == 0 || !contiguous(entities, i) || entities[i - 1].entity_type != "td")
                && i + 1 < entities.len()
                && contiguous(entities, i + 1)
                && entities[i + 1].entity_type == "ty"
            {
                buffer.push(NamedEntity::new(
                    entities[i].start,
                    entities[i + 1].start + entities[i + 1].length - entities[i].start,
                    "T",
                ));
            }

            buffer.push(entities[i].clone());
        }

        if buffer.len() > entities.len() {
            std::mem::swap(entities, buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(primitives: Vec<NamedEntity>) -> Vec<NamedEntity> {
        let processor = CzechAddContainers::new();
        let sentence = Sentence::new();
        let mut entities = primitives;
        let mut buffer = Vec::new();
        processor.process_entities(&sentence, &mut entities, &mut buffer);
        entities
    }

    #[test]
    fn test_person_container() {
        let result = run(vec![
            NamedEntity::new(0, 1, "pf"),
            NamedEntity::new(1, 1, "pf"),
            NamedEntity::new(2, 1, "ps"),
            NamedEntity::new(3, 1, "ps"),
        ]);

        // Primitives preserved, container added in front of the first one
        assert_eq!(result.len(), 5);
        assert_eq!(result[0], NamedEntity::new(0, 4, "P"));
        assert_eq!(result[1], NamedEntity::new(0, 1, "pf"));
    }

    #[test]
    fn test_no_container_without_surname() {
        let result = run(vec![
            NamedEntity::new(0, 1, "pf"),
            NamedEntity::new(1, 1, "pf"),
        ]);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_no_container_across_gap() {
        let result = run(vec![
            NamedEntity::new(0, 1, "pf"),
            NamedEntity::new(2, 1, "ps"),
        ]);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_time_container_full() {
        let result = run(vec![
            NamedEntity::new(0, 1, "td"),
            NamedEntity::new(1, 1, "tm"),
            NamedEntity::new(2, 1, "ty"),
        ]);
        assert_eq!(result.len(), 4);
        assert_eq!(result[0], NamedEntity::new(0, 3, "T"));
    }

    #[test]
    fn test_time_container_day_month() {
        let result = run(vec![
            NamedEntity::new(4, 1, "td"),
            NamedEntity::new(5, 1, "tm"),
        ]);
        assert_eq!(result.len(), 3);
        assert_eq!(result[0], NamedEntity::new(4, 2, "T"));
    }

    #[test]
    fn test_time_container_month_year() {
        let result = run(vec![
            NamedEntity::new(0, 1, "tm"),
            NamedEntity::new(1, 1, "ty"),
        ]);
        assert_eq!(result.len(), 3);
        assert_eq!(result[0], NamedEntity::new(0, 2, "T"));
    }

    #[test]
    fn test_unrelated_entities_untouched() {
        let input = vec![NamedEntity::new(0, 2, "gc"), NamedEntity::new(3, 1, "gh")];
        let result = run(input.clone());
        assert_eq!(result, input);
    }
}
