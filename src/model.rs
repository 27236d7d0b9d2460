use std::path::Path;

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    autograd::{layer_norm, softmax, Param, Tape},
    checkpoint::{self, CheckpointError, WEIGHTS_MAGIC},
    data::LabelMapping,
    tokenizer::Encoding,
};

pub const ARCHITECTURE: &str = "bag-of-words-classifier";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("token id {id} is outside the embedding table of {vocab_size} rows")]
    TokenOutOfRange { id: u32, vocab_size: usize },
    #[error("label {label} is outside the {num_labels} configured labels")]
    LabelOutOfRange { label: usize, num_labels: usize },
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
    #[error("label mapping {found:?} does not match the requested {expected:?}")]
    LabelMismatch {
        expected: LabelMapping,
        found: LabelMapping,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub architecture: String,
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub hidden_dim: usize,
    pub labels: LabelMapping,
}

impl ClassifierConfig {
    pub fn new(vocab_size: usize, embed_dim: usize, hidden_dim: usize, labels: LabelMapping) -> Self {
        Self {
            architecture: ARCHITECTURE.to_string(),
            vocab_size,
            embed_dim,
            hidden_dim,
            labels,
        }
    }

    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.architecture != ARCHITECTURE {
            return Err(ModelError::InvalidConfig(format!(
                "unknown architecture {:?}",
                self.architecture
            )));
        }
        if self.vocab_size == 0 || self.embed_dim == 0 || self.hidden_dim == 0 {
            return Err(ModelError::InvalidConfig(
                "vocab_size, embed_dim and hidden_dim must be > 0".to_string(),
            ));
        }
        if self.num_labels() < 2 || !self.labels.is_consistent() {
            return Err(ModelError::InvalidConfig(
                "label mapping must be a consistent 0..n assignment with n >= 2".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedSample {
    pub encoding: Encoding,
    pub label: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchStats {
    pub loss_sum: f64,
    pub correct: usize,
    pub samples: usize,
}

impl BatchStats {
    pub fn mean_loss(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.loss_sum / self.samples as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }

    pub fn merge(&mut self, other: BatchStats) {
        self.loss_sum += other.loss_sum;
        self.correct += other.correct;
        self.samples += other.samples;
    }
}

/// A sequence classifier that can be fine-tuned and persisted.
pub trait TrainableClassifier {
    fn config(&self) -> &ClassifierConfig;

    /// Label distribution for one encoding. Never touches parameters or
    /// gradients, so it is safe to call on a shared model.
    fn forward(&self, encoding: &Encoding) -> Result<Vec<f64>, ModelError>;

    /// Accumulates gradients of the batch-mean cross-entropy into the
    /// parameters. Does not update them.
    fn backward(&mut self, batch: &[TokenizedSample]) -> Result<BatchStats, ModelError>;

    fn zero_grad(&mut self);

    fn params(&self) -> &[Param];

    fn params_mut(&mut self) -> &mut [Param];

    fn save(&self, path: &Path) -> Result<(), CheckpointError>;

    fn load(path: &Path) -> Result<Self, ModelError>
    where
        Self: Sized;

    /// Forward pass plus loss, without gradients.
    fn evaluate(&self, batch: &[TokenizedSample]) -> Result<BatchStats, ModelError> {
        let mut stats = BatchStats::default();
        for sample in batch {
            let probs = self.forward(&sample.encoding)?;
            let p = probs.get(sample.label).copied().ok_or(ModelError::LabelOutOfRange {
                label: sample.label,
                num_labels: probs.len(),
            })?;
            stats.loss_sum += -(p.max(1e-12)).ln();
            if argmax(&probs) == sample.label {
                stats.correct += 1;
            }
            stats.samples += 1;
        }
        Ok(stats)
    }
}

/// Token embeddings, masked mean pooling, layer norm, one ReLU hidden layer
/// and a linear head.
#[derive(Debug)]
pub struct BagOfWordsClassifier {
    config: ClassifierConfig,
    tape: Tape,
    embeddings: usize,
    hidden_w: usize,
    hidden_b: usize,
    out_w: usize,
    out_b: usize,
}

impl BagOfWordsClassifier {
    pub fn new(config: ClassifierConfig, seed: u64) -> Result<Self, ModelError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tape = Tape::new();

        let embeddings = tape.add_param(Param::normal(
            &mut rng,
            config.vocab_size,
            config.embed_dim,
            0.1,
        ));
        let hidden_w = tape.add_param(Param::normal(
            &mut rng,
            config.hidden_dim,
            config.embed_dim,
            (2.0 / config.embed_dim as f64).sqrt(),
        ));
        let hidden_b = tape.add_param(Param::zeros(1, config.hidden_dim));
        let out_w = tape.add_param(Param::normal(
            &mut rng,
            config.num_labels(),
            config.hidden_dim,
            (1.0 / config.hidden_dim as f64).sqrt(),
        ));
        let out_b = tape.add_param(Param::zeros(1, config.num_labels()));

        Ok(Self {
            config,
            tape,
            embeddings,
            hidden_w,
            hidden_b,
            out_w,
            out_b,
        })
    }

    /// Loads a base model and checks that it was trained for `labels`.
    pub fn from_pretrained(path: &Path, labels: &LabelMapping) -> Result<Self, ModelError> {
        let model = Self::load(path)?;
        if &model.config.labels != labels {
            return Err(ModelError::LabelMismatch {
                expected: labels.clone(),
                found: model.config.labels.clone(),
            });
        }
        Ok(model)
    }

    fn token_rows(&self, encoding: &Encoding) -> Result<Vec<usize>, ModelError> {
        encoding
            .attended_ids()
            .map(|id| {
                let row = id as usize;
                if row < self.config.vocab_size {
                    Ok(row)
                } else {
                    Err(ModelError::TokenOutOfRange {
                        id,
                        vocab_size: self.config.vocab_size,
                    })
                }
            })
            .collect()
    }

    fn param(&self, idx: usize) -> &Param {
        &self.tape.params()[idx]
    }

    /// Logits computed directly from the parameters, mirroring the recorded
    /// ops used during training.
    pub fn logits(&self, encoding: &Encoding) -> Result<Vec<f64>, ModelError> {
        let rows = self.token_rows(encoding)?;
        let dim = self.config.embed_dim;
        let table = &self.param(self.embeddings).data;

        let mut pooled = vec![0.0; dim];
        if !rows.is_empty() {
            let inv = 1.0 / rows.len() as f64;
            for row in &rows {
                let start = row * dim;
                for (c, v) in pooled.iter_mut().enumerate() {
                    *v += table[start + c] * inv;
                }
            }
        }
        let (normed, _) = layer_norm(&pooled);

        let hidden = dense(self.param(self.hidden_w), self.param(self.hidden_b), &normed)
            .into_iter()
            .map(|v| v.max(0.0))
            .collect::<Vec<_>>();
        Ok(dense(self.param(self.out_w), self.param(self.out_b), &hidden))
    }

    fn check_label(&self, label: usize) -> Result<(), ModelError> {
        if label < self.config.num_labels() {
            Ok(())
        } else {
            Err(ModelError::LabelOutOfRange {
                label,
                num_labels: self.config.num_labels(),
            })
        }
    }
}

impl TrainableClassifier for BagOfWordsClassifier {
    fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn forward(&self, encoding: &Encoding) -> Result<Vec<f64>, ModelError> {
        Ok(softmax(&self.logits(encoding)?))
    }

    fn backward(&mut self, batch: &[TokenizedSample]) -> Result<BatchStats, ModelError> {
        let mut stats = BatchStats::default();
        if batch.is_empty() {
            return Ok(stats);
        }
        let inv_batch = 1.0 / batch.len() as f64;

        for sample in batch {
            self.check_label(sample.label)?;
            let rows = self.token_rows(&sample.encoding)?;

            let tape = &mut self.tape;
            tape.clear();
            let pooled = tape.embedding_bag(self.embeddings, &rows);
            let normed = tape.layer_norm(pooled);
            let hidden = tape.matvec(self.hidden_w, normed);
            let hidden = tape.bias_add(self.hidden_b, hidden);
            let hidden = tape.relu(hidden);
            let logits = tape.matvec(self.out_w, hidden);
            let logits = tape.bias_add(self.out_b, logits);
            let loss = tape.cross_entropy(logits, sample.label);

            stats.loss_sum += tape.scalar(loss);
            if argmax(tape.value(logits)) == sample.label {
                stats.correct += 1;
            }
            stats.samples += 1;

            let scaled = tape.scale(loss, inv_batch);
            tape.backward(scaled);
        }
        self.tape.clear();

        Ok(stats)
    }

    fn zero_grad(&mut self) {
        self.tape.zero_grad();
    }

    fn params(&self) -> &[Param] {
        self.tape.params()
    }

    fn params_mut(&mut self) -> &mut [Param] {
        self.tape.params_mut()
    }

    fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let tensors = self
            .tape
            .params()
            .iter()
            .map(|p| p.data.as_slice())
            .collect::<Vec<_>>();
        checkpoint::save(path, WEIGHTS_MAGIC, &self.config, &tensors)
    }

    fn load(path: &Path) -> Result<Self, ModelError> {
        let loaded = checkpoint::load::<ClassifierConfig>(path, WEIGHTS_MAGIC)?;
        let mut model = Self::new(loaded.header, 0)?;
        checkpoint::apply(&loaded.tensors, model.tape.params_mut())?;
        Ok(model)
    }
}

fn dense(weight: &Param, bias: &Param, x: &[f64]) -> Vec<f64> {
    (0..weight.rows)
        .map(|r| {
            let row = &weight.data[r * weight.cols..(r + 1) * weight.cols];
            row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + bias.data[r]
        })
        .collect()
}

pub fn argmax(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, best_v), (i, v)| {
            if *v > best_v {
                (i, *v)
            } else {
                (best, best_v)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{FitOptions, Tokenizer};

    fn tiny_config(vocab_size: usize) -> ClassifierConfig {
        ClassifierConfig::new(vocab_size, 8, 6, LabelMapping::sentiment())
    }

    fn tokenizer() -> Tokenizer {
        let options = FitOptions {
            max_vocab: 32,
            min_frequency: 1,
            oov_buckets: 8,
            max_length: 16,
        };
        Tokenizer::fit(["good great fine", "bad awful poor"], options).expect("fit")
    }

    fn batch(tokenizer: &Tokenizer) -> Vec<TokenizedSample> {
        vec![
            TokenizedSample {
                encoding: tokenizer.encode("good great"),
                label: 1,
            },
            TokenizedSample {
                encoding: tokenizer.encode("bad awful"),
                label: 0,
            },
        ]
    }

    #[test]
    fn forward_returns_distribution() {
        let tokenizer = tokenizer();
        let model =
            BagOfWordsClassifier::new(tiny_config(tokenizer.vocab_size()), 42).expect("model");
        let probs = model.forward(&tokenizer.encode("good movie")).expect("forward");
        assert_eq!(probs.len(), 2);
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn tape_and_direct_forward_agree() {
        let tokenizer = tokenizer();
        let mut model =
            BagOfWordsClassifier::new(tiny_config(tokenizer.vocab_size()), 3).expect("model");
        let samples = batch(&tokenizer);
        let stats = model.backward(&samples[..1]).expect("backward");

        let probs = model.forward(&samples[0].encoding).expect("forward");
        let expected_loss = -probs[1].ln();
        assert!((stats.loss_sum - expected_loss).abs() < 1e-9);
    }

    #[test]
    fn backward_accumulates_gradients() {
        let tokenizer = tokenizer();
        let mut model =
            BagOfWordsClassifier::new(tiny_config(tokenizer.vocab_size()), 5).expect("model");
        let stats = model.backward(&batch(&tokenizer)).expect("backward");
        assert_eq!(stats.samples, 2);
        assert!(stats.mean_loss().is_finite());
        assert!(model.params().iter().any(|p| p.grad.iter().any(|g| *g != 0.0)));

        model.zero_grad();
        assert!(model.params().iter().all(|p| p.grad.iter().all(|g| *g == 0.0)));
    }

    #[test]
    fn out_of_range_tokens_are_rejected() {
        let tokenizer = tokenizer();
        let model = BagOfWordsClassifier::new(tiny_config(4), 1).expect("model");
        let err = model.forward(&tokenizer.encode("good")).unwrap_err();
        assert!(matches!(err, ModelError::TokenOutOfRange { .. }));
    }

    #[test]
    fn out_of_range_labels_are_rejected() {
        let tokenizer = tokenizer();
        let mut model =
            BagOfWordsClassifier::new(tiny_config(tokenizer.vocab_size()), 1).expect("model");
        let sample = TokenizedSample {
            encoding: tokenizer.encode("good"),
            label: 2,
        };
        let err = model.backward(&[sample]).unwrap_err();
        assert!(matches!(err, ModelError::LabelOutOfRange { .. }));
    }

    #[test]
    fn save_and_load_reproduce_predictions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.bin");
        let tokenizer = tokenizer();
        let model =
            BagOfWordsClassifier::new(tiny_config(tokenizer.vocab_size()), 11).expect("model");
        model.save(&path).expect("save");

        let loaded = BagOfWordsClassifier::load(&path).expect("load");
        assert_eq!(loaded.config(), model.config());
        for text in ["good great", "bad", "unknown words here"] {
            let encoding = tokenizer.encode(text);
            assert_eq!(
                loaded.forward(&encoding).expect("forward"),
                model.forward(&encoding).expect("forward")
            );
        }
    }

    #[test]
    fn from_pretrained_checks_label_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.bin");
        BagOfWordsClassifier::new(tiny_config(16), 2)
            .expect("model")
            .save(&path)
            .expect("save");

        let other = LabelMapping::new(["BAD", "GOOD"]);
        let err = BagOfWordsClassifier::from_pretrained(&path, &other).unwrap_err();
        assert!(matches!(err, ModelError::LabelMismatch { .. }));
        assert!(BagOfWordsClassifier::from_pretrained(&path, &LabelMapping::sentiment()).is_ok());
    }

    #[test]
    fn config_validation_rejects_bad_shapes() {
        let mut config = tiny_config(0);
        assert!(config.validate().is_err());
        config.vocab_size = 10;
        assert!(config.validate().is_ok());
        config.labels = LabelMapping::new(["ONLY"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_json_embeds_label_mapping() {
        let json = serde_json::to_value(tiny_config(10)).expect("json");
        assert_eq!(json["labels"]["id2label"]["1"], "POSITIVE");
        assert_eq!(json["labels"]["label2id"]["NEGATIVE"], 0);
    }

    #[test]
    fn argmax_picks_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), 1);
        assert_eq!(argmax(&[]), 0);
    }
}
