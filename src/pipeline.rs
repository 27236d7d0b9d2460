use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    export::{self, ExportError},
    model::{argmax, BagOfWordsClassifier, ModelError, TrainableClassifier},
    tokenizer::Tokenizer,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    /// Probability of `label`, in `[0, 1]`.
    pub score: f64,
}

/// Tokenizer plus classifier, loaded once and then only read.
#[derive(Debug)]
pub struct SentimentPipeline<M = BagOfWordsClassifier> {
    model: M,
    tokenizer: Tokenizer,
}

impl<M: TrainableClassifier> SentimentPipeline<M> {
    pub fn new(model: M, tokenizer: Tokenizer) -> Self {
        Self { model, tokenizer }
    }

    pub fn from_artifact(dir: &Path) -> Result<Self, ExportError> {
        let artifact = export::load_artifact::<M>(dir)?;
        Ok(Self::new(artifact.model, artifact.tokenizer))
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn labels(&self) -> Vec<String> {
        self.model.config().labels.id2label.values().cloned().collect()
    }

    pub fn predict(&self, text: &str) -> Result<Prediction, ModelError> {
        let encoding = self.tokenizer.encode(text);
        let probs = self.model.forward(&encoding)?;
        let best = argmax(&probs);
        let labels = &self.model.config().labels;
        let label = labels.decode(best).ok_or(ModelError::LabelOutOfRange {
            label: best,
            num_labels: labels.len(),
        })?;
        Ok(Prediction {
            label: label.to_string(),
            score: probs[best].clamp(0.0, 1.0),
        })
    }
}
