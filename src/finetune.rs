use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::{
    config::{ConfigError, SentimentConfig},
    data::{self, DataError, LabelMapping},
    export::{self, ArtifactManifest, ArtifactMetrics, ExportError},
    model::{BagOfWordsClassifier, ClassifierConfig, ModelError, TrainableClassifier},
    tokenizer::{Tokenizer, TokenizerError},
    training::{self, JsonlMetricsLog, TrainOutput, Trainer, TrainingError},
};

#[derive(Debug, Error)]
pub enum FineTuneError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Training(#[from] TrainingError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Newest `checkpoint-<step>` under the configured output directory.
    Latest,
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FineTuneReport {
    pub train_samples: usize,
    pub test_samples: usize,
    pub output: TrainOutput,
    pub manifest: ArtifactManifest,
}

/// Loads the corpus, fits or reuses a tokenizer, trains and exports the
/// artifact to `config.export.model_dir`.
pub fn fine_tune(
    config: &SentimentConfig,
    resume: Option<&ResumeFrom>,
) -> Result<FineTuneReport, FineTuneError> {
    config.validate()?;

    let corpus = data::load_corpus(&config.data.corpus)?.subsample(
        config.data.train_samples,
        config.data.test_samples,
        config.data.seed,
    );
    if corpus.test.is_empty() {
        return Err(DataError::Unavailable {
            path: config.data.corpus.clone(),
            reason: "test split is empty after removing rows that also occur in train".to_string(),
        }
        .into());
    }
    info!(
        corpus = %config.data.corpus.display(),
        train = corpus.train.len(),
        test = corpus.test.len(),
        "selected dataset"
    );

    let labels = LabelMapping::sentiment();
    let (model, tokenizer) = initial_model(config, &corpus.train, &labels)?;
    info!(
        vocab_size = tokenizer.vocab_size(),
        max_length = tokenizer.max_length(),
        embed_dim = model.config().embed_dim,
        hidden_dim = model.config().hidden_dim,
        "model ready"
    );

    let train_set = training::tokenize_split(&tokenizer, &corpus.train, &labels)?;
    let eval_set = training::tokenize_split(&tokenizer, &corpus.test, &labels)?;

    let mut trainer = Trainer::new(model, tokenizer, config.training.clone())?
        .with_sink(JsonlMetricsLog::new(&config.training.logging_dir));
    match resume {
        Some(ResumeFrom::Latest) => {
            trainer.resume_from_latest()?;
        }
        Some(ResumeFrom::Path(dir)) => trainer.resume_from(dir)?,
        None => {}
    }

    let output = trainer.train(&train_set, &eval_set)?;
    let last_eval = output.evals.last();
    let metrics = ArtifactMetrics {
        train_loss: Some(output.train_loss),
        eval_loss: last_eval.map(|e| e.eval_loss),
        eval_accuracy: last_eval.map(|e| e.eval_accuracy),
        steps: Some(output.global_step),
    };

    let (model, tokenizer) = trainer.into_parts();
    let manifest =
        export::export_with_metrics(&model, &tokenizer, &config.export.model_dir, metrics)?;

    Ok(FineTuneReport {
        train_samples: corpus.train.len(),
        test_samples: corpus.test.len(),
        output,
        manifest,
    })
}

fn initial_model(
    config: &SentimentConfig,
    train: &data::Split,
    labels: &LabelMapping,
) -> Result<(BagOfWordsClassifier, Tokenizer), FineTuneError> {
    if let Some(base) = &config.model.base_model {
        let artifact = export::load_artifact::<BagOfWordsClassifier>(base)?;
        let found = &artifact.model.config().labels;
        if found != labels {
            return Err(ModelError::LabelMismatch {
                expected: labels.clone(),
                found: found.clone(),
            }
            .into());
        }
        info!(base = %base.display(), "starting from base model");
        return Ok((artifact.model, artifact.tokenizer));
    }

    let tokenizer = Tokenizer::fit(train.texts(), config.tokenizer.fit_options())?;
    let model_config = ClassifierConfig::new(
        tokenizer.vocab_size(),
        config.model.embed_dim,
        config.model.hidden_dim,
        labels.clone(),
    );
    let model = BagOfWordsClassifier::new(model_config, config.training.seed)?;
    Ok((model, tokenizer))
}
