//! Maximum-entropy classifier with direct feature-outcome connections and an
//! optional one-hidden-layer MLP.
//!
//! The direct connections are stored sparsely: `indices[f]` lists the
//! outcomes feature `f` can fire, `weights[f]` the parallel weights, and
//! every present feature contributes `missing_weight` to all outcomes it
//! does not list. Softmax is computed without a max-subtract shift; models
//! are trained to keep logits bounded.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, info};

use crate::codec::{CodecError, Reader, Result, Writer};
use crate::features::Feature;

/// One training example: active features and the gold outcome.
#[derive(Debug, Clone)]
pub struct ClassifierInstance {
    pub features: Vec<Feature>,
    pub outcome: u32,
}

/// Training hyper-parameters, loadable from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkParameters {
    pub iterations: u32,
    pub missing_weight: f64,
    pub initial_learning_rate: f64,
    pub final_learning_rate: f64,
    pub gaussian_sigma: f64,
}

impl Default for NetworkParameters {
    fn default() -> Self {
        NetworkParameters {
            iterations: 10,
            missing_weight: -0.2,
            initial_learning_rate: 0.1,
            final_learning_rate: 0.01,
            gaussian_sigma: 0.5,
        }
    }
}

#[derive(Debug, Default)]
struct HiddenLayer {
    size: usize,
    /// `[feature][hidden]` input weights.
    input_weights: Vec<Vec<f32>>,
    /// `[hidden][outcome]` output weights.
    output_weights: Vec<Vec<f32>>,
}

#[derive(Debug, Default)]
pub struct NetworkClassifier {
    indices: Vec<Vec<u32>>,
    weights: Vec<Vec<f32>>,
    missing_weight: f64,
    hidden: Option<HiddenLayer>,
    outcomes: usize,
}

impl NetworkClassifier {
    /// Size of the output layer.
    pub fn outcomes(&self) -> usize {
        self.outcomes
    }

    /// Size of the hidden layer, 0 when only direct connections exist.
    pub fn hidden_size(&self) -> usize {
        self.hidden.as_ref().map(|h| h.size).unwrap_or(0)
    }

    /// Compute the outcome distribution for one token.
    ///
    /// `out` must have length [`Self::outcomes`]; `hidden_buf` is scratch
    /// reused across calls. Feature ids beyond the trained range are
    /// dropped from the direct connections.
    pub fn classify(&self, features: &[Feature], out: &mut [f64], hidden_buf: &mut Vec<f64>) {
        debug_assert_eq!(out.len(), self.outcomes);

        out.fill(features.len() as f64 * self.missing_weight);

        for &feature in features {
            let Some(row) = self.indices.get(feature as usize) else {
                continue;
            };
            let weights = &self.weights[feature as usize];
            for (k, &outcome) in row.iter().enumerate() {
                out[outcome as usize] += weights[k] as f64 - self.missing_weight;
            }
        }

        if let Some(hidden) = &self.hidden {
            hidden_buf.clear();
            hidden_buf.resize(hidden.size, 0.0);
            for &feature in features {
                if let Some(row) = hidden.input_weights.get(feature as usize) {
                    for (k, &w) in row.iter().enumerate() {
                        hidden_buf[k] += w as f64;
                    }
                }
            }
            for h in hidden_buf.iter_mut() {
                *h = 1.0 / (1.0 + (-*h).exp());
            }
            for (k, &h) in hidden_buf.iter().enumerate() {
                for (o, &w) in hidden.output_weights[k].iter().enumerate() {
                    out[o] += h * w as f64;
                }
            }
        }

        softmax(out);
    }

    /// Arg-max of a distribution; ties go to the lowest index.
    pub fn best_outcome(out: &[f64]) -> usize {
        let mut best = 0;
        for (i, &p) in out.iter().enumerate().skip(1) {
            if p > out[best] {
                best = i;
            }
        }
        best
    }

    pub fn load(r: &mut Reader) -> Result<Self> {
        let indices = load_matrix_u32(r)?;
        let missing_weight = r.next_f64()?;
        let weights = load_matrix_f32(r)?;

        if weights.len() != indices.len()
            || indices
                .iter()
                .zip(&weights)
                .any(|(i, w)| i.len() != w.len())
        {
            return Err(CodecError::Format(
                "classifier weight matrix does not match index matrix".to_string(),
            ));
        }

        let hidden_size = r.next_u16()? as usize;
        let hidden = if hidden_size > 0 {
            let input_weights = load_matrix_f32(r)?;
            let output_weights = load_matrix_f32(r)?;
            Some(HiddenLayer {
                size: hidden_size,
                input_weights,
                output_weights,
            })
        } else {
            None
        };

        let outcomes = r.next_u16()? as usize;

        // A model file is untrusted input: verify every index row is sorted
        // and unique and every listed outcome is addressable.
        for row in &indices {
            if row.windows(2).any(|w| w[0] >= w[1]) {
                return Err(CodecError::Format(
                    "classifier indices are not sorted and unique".to_string(),
                ));
            }
            if row.last().is_some_and(|&o| o as usize >= outcomes) {
                return Err(CodecError::Format(
                    "classifier index outcome out of range".to_string(),
                ));
            }
        }
        if let Some(h) = &hidden {
            if h.input_weights.iter().any(|row| row.len() != h.size)
                || h.output_weights.len() != h.size
                || h.output_weights.iter().any(|row| row.len() != outcomes)
            {
                return Err(CodecError::Format(
                    "classifier hidden layer shape mismatch".to_string(),
                ));
            }
        }

        Ok(NetworkClassifier {
            indices,
            weights,
            missing_weight,
            hidden,
            outcomes,
        })
    }

    pub fn save(&self, w: &mut Writer) {
        save_matrix_u32(w, &self.indices);
        w.put_f64(self.missing_weight);
        save_matrix_f32(w, &self.weights);

        match &self.hidden {
            Some(hidden) => {
                w.put_u16(hidden.size as u16);
                save_matrix_f32(w, &hidden.input_weights);
                save_matrix_f32(w, &hidden.output_weights);
            }
            None => w.put_u16(0),
        }

        w.put_u16(self.outcomes as u16);
    }

    /// Train direct connections with SGD and L2 regularisation.
    ///
    /// The learning rate is log-interpolated from the initial to the final
    /// value across iterations; instances are shuffled with a fixed seed so
    /// training runs are reproducible.
    pub fn train(
        features: u32,
        outcomes: u32,
        train: &[ClassifierInstance],
        heldout: &[ClassifierInstance],
        parameters: &NetworkParameters,
    ) -> anyhow::Result<Self> {
        if features == 0 {
            anyhow::bail!("there must be more than zero features");
        }
        if outcomes == 0 {
            anyhow::bail!("there must be more than zero outcomes");
        }
        if train.is_empty() {
            anyhow::bail!("no training data");
        }
        for instance in train.iter().chain(heldout) {
            if instance.outcome >= outcomes {
                anyhow::bail!("training instance outcome out of range");
            }
            if instance.features.iter().any(|&f| f >= features) {
                anyhow::bail!("training instance feature out of range");
            }
        }

        // Indices from observed feature-outcome pairs, sorted and unique
        let mut indices: Vec<Vec<u32>> = vec![Vec::new(); features as usize];
        for instance in train {
            for &feature in &instance.features {
                indices[feature as usize].push(instance.outcome);
            }
        }
        for row in &mut indices {
            row.sort_unstable();
            row.dedup();
        }

        let weights: Vec<Vec<f32>> = indices.iter().map(|row| vec![0.0; row.len()]).collect();

        let mut classifier = NetworkClassifier {
            indices,
            weights,
            missing_weight: parameters.missing_weight,
            hidden: None,
            outcomes: outcomes as usize,
        };

        let gaussian_sigma = parameters.gaussian_sigma / train.len() as f64;
        let mut output = vec![0.0f64; outcomes as usize];
        let mut hidden_buf = Vec::new();

        let mut permutation: Vec<usize> = (0..train.len()).collect();
        let mut rng = StdRng::seed_from_u64(42);

        for iteration in 0..parameters.iterations {
            let learning_rate =
                if parameters.final_learning_rate > 0.0 && parameters.iterations > 1 {
                    let steps = (parameters.iterations - 1) as f64;
                    (((steps - iteration as f64) * parameters.initial_learning_rate.ln()
                        + iteration as f64 * parameters.final_learning_rate.ln())
                        / steps)
                        .exp()
                } else {
                    parameters.initial_learning_rate
                };

            let mut logprob = 0.0;
            let mut training_correct = 0usize;

            permutation.shuffle(&mut rng);
            for &index in &permutation {
                let instance = &train[index];
                classifier.classify(&instance.features, &mut output, &mut hidden_buf);

                logprob += output[instance.outcome as usize].ln();
                training_correct +=
                    (Self::best_outcome(&output) == instance.outcome as usize) as usize;

                // Improve weights according to the correct outcome
                for &feature in &instance.features {
                    let row = &classifier.indices[feature as usize];
                    let weights = &mut classifier.weights[feature as usize];
                    for (k, &outcome) in row.iter().enumerate() {
                        let error = (outcome == instance.outcome) as u32 as f64
                            - output[outcome as usize];
                        weights[k] = (weights[k] as f64 + learning_rate * error
                            - weights[k] as f64 * gaussian_sigma)
                            as f32;
                    }
                }
            }

            let training_acc = training_correct as f64 * 100.0 / train.len() as f64;
            if heldout.is_empty() {
                info!(
                    iteration = iteration + 1,
                    learning_rate, logprob, training_acc, "classifier training iteration"
                );
            } else {
                let mut heldout_correct = 0usize;
                for instance in heldout {
                    classifier.classify(&instance.features, &mut output, &mut hidden_buf);
                    heldout_correct +=
                        (Self::best_outcome(&output) == instance.outcome as usize) as usize;
                }
                let heldout_acc = heldout_correct as f64 * 100.0 / heldout.len() as f64;
                info!(
                    iteration = iteration + 1,
                    learning_rate, logprob, training_acc, heldout_acc,
                    "classifier training iteration"
                );
            }
        }
        debug!(
            features,
            outcomes, instances = train.len(), "classifier training finished"
        );

        Ok(classifier)
    }
}

/// Softmax in place; a non-finite or non-positive exponential sum (possible
/// only with a malicious model) falls back to a uniform distribution.
fn softmax(out: &mut [f64]) {
    let mut sum = 0.0;
    for v in out.iter_mut() {
        *v = v.exp();
        sum += *v;
    }
    if !sum.is_finite() || sum <= 0.0 {
        out.fill(1.0 / out.len() as f64);
        return;
    }
    let sum = 1.0 / sum;
    for v in out.iter_mut() {
        *v *= sum;
    }
}

fn load_matrix_u32(r: &mut Reader) -> Result<Vec<Vec<u32>>> {
    let rows = r.next_u32()? as usize;
    let mut matrix = Vec::with_capacity(rows);
    for _ in 0..rows {
        let len = r.next_u16()? as usize;
        let mut row = Vec::with_capacity(len);
        for _ in 0..len {
            row.push(r.next_u32()?);
        }
        matrix.push(row);
    }
    Ok(matrix)
}

fn load_matrix_f32(r: &mut Reader) -> Result<Vec<Vec<f32>>> {
    let rows = r.next_u32()? as usize;
    let mut matrix = Vec::with_capacity(rows);
    for _ in 0..rows {
        let len = r.next_u16()? as usize;
        let mut row = Vec::with_capacity(len);
        for _ in 0..len {
            row.push(r.next_f32()?);
        }
        matrix.push(row);
    }
    Ok(matrix)
}

fn save_matrix_u32(w: &mut Writer, matrix: &[Vec<u32>]) {
    w.put_u32(matrix.len() as u32);
    for row in matrix {
        w.put_u16(row.len() as u16);
        for &v in row {
            w.put_u32(v);
        }
    }
}

fn save_matrix_f32(w: &mut Writer, matrix: &[Vec<f32>]) {
    w.put_u32(matrix.len() as u32);
    for row in matrix {
        w.put_u16(row.len() as u16);
        for &v in row {
            w.put_f32(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_classifier() -> NetworkClassifier {
        // Two features, three outcomes. Feature 0 fires outcome 0 strongly,
        // feature 1 fires outcomes 1 and 2.
        NetworkClassifier {
            indices: vec![vec![0], vec![1, 2]],
            weights: vec![vec![2.0], vec![1.0, 0.5]],
            missing_weight: -0.5,
            hidden: None,
            outcomes: 3,
        }
    }

    #[test]
    fn test_classify_distribution_sums_to_one() {
        let classifier = tiny_classifier();
        let mut out = vec![0.0; 3];
        let mut hidden = Vec::new();
        classifier.classify(&[0, 1], &mut out, &mut hidden);

        let sum: f64 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(out.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_classify_prefers_connected_outcome() {
        let classifier = tiny_classifier();
        let mut out = vec![0.0; 3];
        let mut hidden = Vec::new();

        classifier.classify(&[0], &mut out, &mut hidden);
        assert_eq!(NetworkClassifier::best_outcome(&out), 0);

        classifier.classify(&[1], &mut out, &mut hidden);
        assert_eq!(NetworkClassifier::best_outcome(&out), 1);
    }

    #[test]
    fn test_out_of_range_feature_is_dropped() {
        let classifier = tiny_classifier();
        let mut out_without = vec![0.0; 3];
        let mut out_with = vec![0.0; 3];
        let mut hidden = Vec::new();

        classifier.classify(&[0], &mut out_without, &mut hidden);
        classifier.classify(&[0, 999], &mut out_with, &mut hidden);

        // The stray feature only shifts all logits by missing_weight,
        // which softmax cancels out.
        for (a, b) in out_without.iter().zip(&out_with) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_best_outcome_tie_goes_to_lowest() {
        assert_eq!(NetworkClassifier::best_outcome(&[0.4, 0.4, 0.2]), 0);
        assert_eq!(NetworkClassifier::best_outcome(&[0.1, 0.4, 0.4]), 1);
    }

    #[test]
    fn test_save_load_round_trip() {
        let classifier = tiny_classifier();
        let mut w = Writer::new();
        classifier.save(&mut w);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        let loaded = NetworkClassifier::load(&mut r).unwrap();
        assert!(r.is_end());

        let mut expected = vec![0.0; 3];
        let mut actual = vec![0.0; 3];
        let mut hidden = Vec::new();
        classifier.classify(&[0, 1], &mut expected, &mut hidden);
        loaded.classify(&[0, 1], &mut actual, &mut hidden);
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_load_rejects_unsorted_indices() {
        let classifier = NetworkClassifier {
            indices: vec![vec![2, 1]],
            weights: vec![vec![1.0, 1.0]],
            missing_weight: 0.0,
            hidden: None,
            outcomes: 3,
        };
        let mut w = Writer::new();
        classifier.save(&mut w);
        let bytes = w.into_bytes();
        assert!(NetworkClassifier::load(&mut Reader::new(&bytes)).is_err());
    }

    #[test]
    fn test_load_rejects_out_of_range_outcome() {
        let classifier = NetworkClassifier {
            indices: vec![vec![5]],
            weights: vec![vec![1.0]],
            missing_weight: 0.0,
            hidden: None,
            outcomes: 3,
        };
        let mut w = Writer::new();
        classifier.save(&mut w);
        let bytes = w.into_bytes();
        assert!(NetworkClassifier::load(&mut Reader::new(&bytes)).is_err());
    }

    #[test]
    fn test_hidden_layer_round_trip_and_effect() {
        let classifier = NetworkClassifier {
            indices: vec![vec![0]],
            weights: vec![vec![0.0]],
            missing_weight: 0.0,
            hidden: Some(HiddenLayer {
                size: 2,
                input_weights: vec![vec![4.0, -4.0]],
                output_weights: vec![vec![3.0, 0.0], vec![0.0, 3.0]],
            }),
            outcomes: 2,
        };

        let mut w = Writer::new();
        classifier.save(&mut w);
        let bytes = w.into_bytes();
        let loaded = NetworkClassifier::load(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(loaded.hidden_size(), 2);

        let mut out = vec![0.0; 2];
        let mut hidden = Vec::new();
        loaded.classify(&[0], &mut out, &mut hidden);
        // Hidden unit 0 saturates near 1, unit 1 near 0, so outcome 0 wins
        assert_eq!(NetworkClassifier::best_outcome(&out), 0);
        assert!(out[0] > 0.8);
    }

    #[test]
    fn test_softmax_nan_fallback() {
        let mut out = vec![f64::NAN, 1.0];
        softmax(&mut out);
        assert_eq!(out, vec![0.5, 0.5]);
    }

    #[test]
    fn test_train_separable_data() {
        let train: Vec<ClassifierInstance> = (0..20)
            .map(|i| ClassifierInstance {
                features: vec![(i % 2) as Feature],
                outcome: (i % 2) as u32,
            })
            .collect();

        let parameters = NetworkParameters {
            iterations: 20,
            ..NetworkParameters::default()
        };
        let classifier = NetworkClassifier::train(2, 2, &train, &[], &parameters).unwrap();

        let mut out = vec![0.0; 2];
        let mut hidden = Vec::new();
        classifier.classify(&[0], &mut out, &mut hidden);
        assert_eq!(NetworkClassifier::best_outcome(&out), 0);
        classifier.classify(&[1], &mut out, &mut hidden);
        assert_eq!(NetworkClassifier::best_outcome(&out), 1);
    }

    #[test]
    fn test_train_is_deterministic() {
        let train: Vec<ClassifierInstance> = (0..10)
            .map(|i| ClassifierInstance {
                features: vec![(i % 3) as Feature],
                outcome: (i % 2) as u32,
            })
            .collect();
        let parameters = NetworkParameters::default();

        let a = NetworkClassifier::train(3, 2, &train, &[], &parameters).unwrap();
        let b = NetworkClassifier::train(3, 2, &train, &[], &parameters).unwrap();
        assert_eq!(a.weights, b.weights);
    }

    #[test]
    fn test_train_rejects_bad_instances() {
        let instance = ClassifierInstance {
            features: vec![5],
            outcome: 0,
        };
        assert!(
            NetworkClassifier::train(2, 2, &[instance], &[], &NetworkParameters::default())
                .is_err()
        );
    }
}
