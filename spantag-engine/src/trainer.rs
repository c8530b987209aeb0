//! Training: BIO-labelled data loading, per-stage classifier training and
//! artifact assembly.
//!
//! Training data is UTF-8 text, one `form<TAB>label` token per line, blank
//! line ending a sentence. Labels are `O` (or `_`) for outside tokens and
//! `B-TYPE` / `I-TYPE` for entity tokens; they are converted to BILOU
//! outcomes by examining each token's neighbours.

use std::io::BufRead;

use anyhow::{Context, bail};
use tracing::info;

use crate::bilou::{self, BilouTag, ENTITY_UNKNOWN, Outcome};
use crate::classifier::{ClassifierInstance, NetworkClassifier, NetworkParameters};
use crate::entity_map::EntityMap;
use crate::features::{FeatureTemplates, Pipeline};
use crate::recognizer::{ModelVariant, Recognizer, local_probs_from_outcomes};
use crate::sentence::Sentence;
use crate::tagger::{Tagger, TaggerKind, WhitespaceTokenizer};

/// Parse training hyper-parameters from TOML.
pub fn parameters_from_toml(text: &str) -> anyhow::Result<NetworkParameters> {
    toml::from_str(text).context("cannot parse network parameters")
}

struct LabelledSentence {
    sentence: Sentence,
    outcomes: Vec<Outcome>,
}

/// Train a multi-stage recogniser.
///
/// Each stage is trained on instances generated with the shared template
/// set (later stages admit additional keys, notably for `PreviousStage`
/// templates); the decoded labels of a trained stage become the
/// `previous_stage` input of the next one.
pub fn train(
    variant: ModelVariant,
    tagger_kind: TaggerKind,
    stages: usize,
    parameters: &NetworkParameters,
    feature_templates: &str,
    train_data: impl BufRead,
    heldout_data: Option<Box<dyn BufRead>>,
) -> anyhow::Result<Recognizer> {
    if stages == 0 {
        bail!("cannot train a recognizer with zero stages");
    }
    if stages >= 256 {
        bail!("cannot train a recognizer with {stages} stages, the limit is 255");
    }

    let tagger = tagger_kind.create();
    let mut entities = EntityMap::new();

    info!("loading training data");
    let mut train_sentences = load_data(train_data, tagger.as_ref(), &mut entities, true)?;
    info!(sentences = train_sentences.len(), "training data loaded");
    if entities.is_empty() {
        bail!("no named entities present in the training data");
    }

    let mut heldout_sentences = match heldout_data {
        Some(data) => {
            let sentences = load_data(data, tagger.as_ref(), &mut entities, false)?;
            info!(sentences = sentences.len(), "heldout data loaded");
            sentences
        }
        None => Vec::new(),
    };

    let tokenizer = WhitespaceTokenizer;
    let templates = {
        let pipeline = Pipeline {
            tokenizer: &tokenizer,
            tagger: tagger.as_ref(),
        };
        FeatureTemplates::parse(feature_templates.as_bytes(), &mut entities, &pipeline)
            .context("cannot parse feature templates")?
    };

    let total_outcomes = bilou::total_outcomes(entities.len() as u32);
    let mut networks = Vec::with_capacity(stages);

    for stage in 0..stages {
        info!(stage = stage + 1, "generating features");
        let mut train_instances = Vec::new();
        let mut heldout_instances = Vec::new();
        generate_instances(&mut train_sentences, &templates, &mut train_instances, true);
        generate_instances(
            &mut heldout_sentences,
            &templates,
            &mut heldout_instances,
            false,
        );

        info!(stage = stage + 1, "training classifier");
        let network = NetworkClassifier::train(
            templates.total_features(),
            total_outcomes,
            &train_instances,
            &heldout_instances,
            parameters,
        )
        .with_context(|| format!("cannot train the stage {} classifier", stage + 1))?;

        compute_previous_stage(&mut train_sentences, &templates, &network, &entities);
        compute_previous_stage(&mut heldout_sentences, &templates, &network, &entities);

        networks.push(network);
    }

    Ok(Recognizer::from_parts(
        variant, tagger_kind, tagger, entities, templates, networks,
    ))
}

/// Convert one sentence's BIO labels to BILOU outcomes.
///
/// A lone `B-T` becomes `U(T)`; a `B-T` with a same-type continuation opens
/// `B(T) I … I L`. With `add_entities` unset, a label naming an entity
/// outside the admitted set is an error.
fn convert_labels(
    labels: &[String],
    entities: &mut EntityMap,
    add_entities: bool,
) -> anyhow::Result<Vec<Outcome>> {
    let mut outcomes = Vec::with_capacity(labels.len());

    for (i, label) in labels.iter().enumerate() {
        if label == "_" || label == "O" {
            outcomes.push(bilou::outcome_from(BilouTag::O, ENTITY_UNKNOWN));
            continue;
        }
        if label.len() >= 3 && (label.starts_with("B-") || label.starts_with("I-")) {
            let has_prev =
                i > 0 && label.starts_with('I') && labels[i - 1].get(1..) == label.get(1..);
            let has_next = i + 1 < labels.len()
                && !labels[i + 1].starts_with('B')
                && labels[i + 1].get(1..) == label.get(1..);

            let entity = if add_entities {
                entities.parse_or_add(&label[2..])
            } else {
                let entity = entities.parse(&label[2..]);
                if entity == ENTITY_UNKNOWN {
                    bail!("entity type '{}' is not present in the training data", &label[2..]);
                }
                entity
            };

            outcomes.push(match (has_prev, has_next) {
                (false, false) => bilou::outcome_u(entity),
                (false, true) => bilou::outcome_b(entity),
                (true, true) => bilou::outcome_from(BilouTag::I, ENTITY_UNKNOWN),
                (true, false) => bilou::outcome_from(BilouTag::L, ENTITY_UNKNOWN),
            });
            continue;
        }
        bail!("cannot parse entity label '{label}'");
    }

    Ok(outcomes)
}

fn finish_sentence(
    words: &mut Vec<String>,
    labels: &mut Vec<String>,
    tagger: &dyn Tagger,
    entities: &mut EntityMap,
    add_entities: bool,
    sentences: &mut Vec<LabelledSentence>,
) -> anyhow::Result<()> {
    if words.is_empty() {
        return Ok(());
    }
    let forms: Vec<&str> = words.iter().map(String::as_str).collect();
    let mut sentence = Sentence::new();
    tagger.tag(&forms, &mut sentence);
    sentence.clear_previous_stage();

    let outcomes = convert_labels(labels, entities, add_entities)?;
    sentences.push(LabelledSentence { sentence, outcomes });

    words.clear();
    labels.clear();
    Ok(())
}

fn load_data(
    data: impl BufRead,
    tagger: &dyn Tagger,
    entities: &mut EntityMap,
    add_entities: bool,
) -> anyhow::Result<Vec<LabelledSentence>> {
    let mut sentences = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut labels: Vec<String> = Vec::new();

    for line in data.lines() {
        let line = line?;
        if line.is_empty() {
            finish_sentence(
                &mut words,
                &mut labels,
                tagger,
                entities,
                add_entities,
                &mut sentences,
            )?;
            continue;
        }
        let Some((form, label)) = line.split_once('\t') else {
            bail!("the training data line '{line}' does not contain two columns");
        };
        if label.contains('\t') {
            bail!("the training data line '{line}' does not contain two columns");
        }
        words.push(form.to_string());
        labels.push(label.to_string());
    }
    finish_sentence(
        &mut words,
        &mut labels,
        tagger,
        entities,
        add_entities,
        &mut sentences,
    )?;

    Ok(sentences)
}

/// Extract features for every sentence and emit one classifier instance per
/// token. New feature keys are admitted only when `add_features` is set.
fn generate_instances(
    data: &mut [LabelledSentence],
    templates: &FeatureTemplates,
    instances: &mut Vec<ClassifierInstance>,
    add_features: bool,
) {
    let mut buffer = String::new();

    for labelled in data.iter_mut() {
        labelled.sentence.clear_local_filled();
        templates.process_sentence(&mut labelled.sentence, &mut buffer, add_features);

        for i in 0..labelled.sentence.size {
            instances.push(ClassifierInstance {
                features: labelled.sentence.features[i].clone(),
                outcome: labelled.outcomes[i],
            });
        }
    }
}

/// Run the freshly trained stage over the data and decode, so the next
/// stage sees its labels in `previous_stage`.
fn compute_previous_stage(
    data: &mut [LabelledSentence],
    templates: &FeatureTemplates,
    network: &NetworkClassifier,
    entities: &EntityMap,
) {
    let mut buffer = String::new();
    let mut outcomes = vec![0.0f64; network.outcomes()];
    let mut hidden = Vec::new();

    for labelled in data.iter_mut() {
        let sentence = &mut labelled.sentence;
        sentence.clear_local_filled();
        templates.process_sentence(sentence, &mut buffer, false);

        for i in 0..sentence.size {
            if !sentence.probabilities[i].local_filled {
                network.classify(&sentence.features[i], &mut outcomes, &mut hidden);
                sentence.probabilities[i].local =
                    local_probs_from_outcomes(&outcomes, entities.len() as u32);
                sentence.probabilities[i].local_filled = true;
            }

            if i == 0 {
                let local = sentence.probabilities[0].local;
                sentence.probabilities[0].global.init(&local);
            } else {
                let local = sentence.probabilities[i].local;
                let prev = sentence.probabilities[i - 1].global;
                sentence.probabilities[i].global.update(&local, &prev);
            }
        }

        sentence.compute_best_decoding();
        sentence.fill_previous_stage();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_convert_labels_lone_b_is_unit() {
        let mut entities = EntityMap::new();
        let outcomes =
            convert_labels(&labels(&["O", "B-PER", "O"]), &mut entities, true).unwrap();
        assert_eq!(
            outcomes,
            vec![
                bilou::outcome_from(BilouTag::O, ENTITY_UNKNOWN),
                bilou::outcome_u(0),
                bilou::outcome_from(BilouTag::O, ENTITY_UNKNOWN),
            ]
        );
    }

    #[test]
    fn test_convert_labels_bil_chain() {
        let mut entities = EntityMap::new();
        let outcomes = convert_labels(
            &labels(&["B-LOC", "I-LOC", "I-LOC", "O"]),
            &mut entities,
            true,
        )
        .unwrap();
        assert_eq!(
            outcomes,
            vec![
                bilou::outcome_b(0),
                bilou::outcome_from(BilouTag::I, ENTITY_UNKNOWN),
                bilou::outcome_from(BilouTag::L, ENTITY_UNKNOWN),
                bilou::outcome_from(BilouTag::O, ENTITY_UNKNOWN),
            ]
        );
    }

    #[test]
    fn test_convert_labels_type_change_splits_entities() {
        let mut entities = EntityMap::new();
        let outcomes =
            convert_labels(&labels(&["B-LOC", "B-PER"]), &mut entities, true).unwrap();
        // A following B- of any type never continues the previous entity
        assert_eq!(outcomes, vec![bilou::outcome_u(0), bilou::outcome_u(1)]);
    }

    #[test]
    fn test_convert_labels_interior_i_without_successor_is_last() {
        let mut entities = EntityMap::new();
        let outcomes = convert_labels(
            &labels(&["B-ORG", "I-ORG", "I-PER"]),
            &mut entities,
            true,
        )
        .unwrap();
        // I-PER does not continue I-ORG: the ORG chain ends at position 1
        // and I-PER starts its own unit-like chain head
        assert_eq!(outcomes[0], bilou::outcome_b(0));
        assert_eq!(outcomes[1], bilou::outcome_from(BilouTag::L, ENTITY_UNKNOWN));
        assert_eq!(outcomes[2], bilou::outcome_u(1));
    }

    #[test]
    fn test_convert_labels_underscore_is_outside() {
        let mut entities = EntityMap::new();
        let outcomes = convert_labels(&labels(&["_"]), &mut entities, true).unwrap();
        assert_eq!(outcomes, vec![bilou::outcome_from(BilouTag::O, ENTITY_UNKNOWN)]);
    }

    #[test]
    fn test_convert_labels_rejects_garbage() {
        let mut entities = EntityMap::new();
        assert!(convert_labels(&labels(&["X-PER"]), &mut entities, true).is_err());
        assert!(convert_labels(&labels(&["B-"]), &mut entities, true).is_err());
    }

    #[test]
    fn test_convert_labels_unknown_entity_fatal_without_add() {
        let mut entities = EntityMap::new();
        entities.parse_or_add("PER");
        assert!(convert_labels(&labels(&["B-LOC"]), &mut entities, false).is_err());
        assert!(convert_labels(&labels(&["B-PER"]), &mut entities, false).is_ok());
    }

    #[test]
    fn test_load_data_sentence_splitting() {
        let data = "John\tB-PER\n\nParis\tB-LOC\nis\tO\n";
        let mut entities = EntityMap::new();
        let tagger = crate::tagger::TrivialTagger;
        let sentences = load_data(data.as_bytes(), &tagger, &mut entities, true).unwrap();

        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].sentence.size, 1);
        assert_eq!(sentences[1].sentence.size, 2);
        assert_eq!(entities.len(), 2);
    }

    #[test]
    fn test_load_data_rejects_wrong_columns() {
        let mut entities = EntityMap::new();
        let tagger = crate::tagger::TrivialTagger;
        assert!(load_data("justoneword\n".as_bytes(), &tagger, &mut entities, true).is_err());
        assert!(
            load_data("a\tb\tc\n".as_bytes(), &tagger, &mut entities, true).is_err()
        );
    }

    #[test]
    fn test_parameters_from_toml() {
        let parameters = parameters_from_toml(
            "iterations = 5\nmissing_weight = -0.1\ninitial_learning_rate = 0.2\n",
        )
        .unwrap();
        assert_eq!(parameters.iterations, 5);
        assert_eq!(parameters.missing_weight, -0.1);
        assert_eq!(parameters.initial_learning_rate, 0.2);
        // Unlisted fields keep their defaults
        assert_eq!(parameters.final_learning_rate, 0.01);
    }

    #[test]
    fn test_train_rejects_bad_stage_counts() {
        let parameters = NetworkParameters::default();
        assert!(
            train(
                ModelVariant::Generic,
                TaggerKind::Trivial,
                0,
                &parameters,
                "Form\n",
                "a\tB-PER\n".as_bytes(),
                None,
            )
            .is_err()
        );
        assert!(
            train(
                ModelVariant::Generic,
                TaggerKind::Trivial,
                256,
                &parameters,
                "Form\n",
                "a\tB-PER\n".as_bytes(),
                None,
            )
            .is_err()
        );
    }

    #[test]
    fn test_train_requires_entities() {
        let parameters = NetworkParameters::default();
        assert!(
            train(
                ModelVariant::Generic,
                TaggerKind::Trivial,
                1,
                &parameters,
                "Form\n",
                "just\tO\nwords\tO\n".as_bytes(),
                None,
            )
            .is_err()
        );
    }
}
