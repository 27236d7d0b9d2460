use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    autograd::Param,
    checkpoint::{self, CheckpointError, OPTIMIZER_MAGIC, WEIGHTS_MAGIC},
    data::{LabelMapping, Split},
    model::{BatchStats, ClassifierConfig, ModelError, TokenizedSample, TrainableClassifier},
    tokenizer::{Tokenizer, TokenizerError},
};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
pub const MODEL_FILE: &str = "model.bin";
pub const OPTIMIZER_FILE: &str = "optimizer.bin";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const CONFIG_FILE: &str = "config.json";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training arguments: {0}")]
    InvalidArgs(String),
    #[error("training split is empty")]
    EmptyTrainSplit,
    #[error("label {0:?} has no id in the model's label mapping")]
    UnmappedLabel(String),
    #[error("loss diverged at step {step}: {loss}")]
    Divergence { step: u64, loss: f64 },
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("checkpoint {path} does not match this run: {reason}")]
    ResumeMismatch { path: PathBuf, reason: String },
    #[error("no checkpoint found in {0}")]
    NoCheckpoint(PathBuf),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Run configuration. Fixed for the lifetime of a [`Trainer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    pub logging_dir: PathBuf,
    pub epochs: usize,
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub warmup_steps: usize,
    pub logging_steps: usize,
    pub seed: u64,
    pub save_total_limit: Option<usize>,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./results"),
            logging_dir: PathBuf::from("./logs"),
            epochs: 5,
            train_batch_size: 16,
            eval_batch_size: 16,
            learning_rate: 5e-3,
            weight_decay: 0.0,
            warmup_steps: 0,
            logging_steps: 50,
            seed: 42,
            save_total_limit: None,
        }
    }
}

impl TrainingArgs {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.epochs == 0 {
            return Err(TrainingError::InvalidArgs("epochs must be > 0".to_string()));
        }
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return Err(TrainingError::InvalidArgs(
                "batch sizes must be > 0".to_string(),
            ));
        }
        if self.logging_steps == 0 {
            return Err(TrainingError::InvalidArgs(
                "logging_steps must be > 0".to_string(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(TrainingError::InvalidArgs(
                "learning_rate must be a positive number".to_string(),
            ));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(TrainingError::InvalidArgs(
                "weight_decay must be >= 0".to_string(),
            ));
        }
        if self.save_total_limit == Some(0) {
            return Err(TrainingError::InvalidArgs(
                "save_total_limit must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn steps_per_epoch(&self, train_len: usize) -> usize {
        train_len.div_ceil(self.train_batch_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AdamHeader {
    step: u64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
}

/// Adam with decoupled weight decay.
#[derive(Debug)]
pub struct Adam {
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    t: u64,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
}

impl Adam {
    pub fn new(params: &[Param], weight_decay: f64) -> Self {
        let m = params.iter().map(|p| vec![0.0; p.data.len()]).collect();
        let v = params.iter().map(|p| vec![0.0; p.data.len()]).collect();
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            t: 0,
            m,
            v,
        }
    }

    pub fn steps(&self) -> u64 {
        self.t
    }

    pub fn step(&mut self, params: &mut [Param], lr: f64) {
        self.t += 1;
        let t = self.t as f64;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);
        for (param_idx, param) in params.iter_mut().enumerate() {
            let m = &mut self.m[param_idx];
            let v = &mut self.v[param_idx];
            for i in 0..param.data.len() {
                let grad = param.grad[i];
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * grad;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * grad * grad;

                let m_hat = m[i] / bias1;
                let v_hat = v[i] / bias2;
                if self.weight_decay > 0.0 {
                    param.data[i] -= lr * self.weight_decay * param.data[i];
                }
                param.data[i] -= lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let header = AdamHeader {
            step: self.t,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };
        let tensors = self
            .m
            .iter()
            .chain(&self.v)
            .map(Vec::as_slice)
            .collect::<Vec<_>>();
        checkpoint::save(path, OPTIMIZER_MAGIC, &header, &tensors)
    }

    /// Restores moment estimates saved for a model with the same parameter
    /// shapes as `params`.
    pub fn load(path: &Path, params: &[Param]) -> Result<Self, CheckpointError> {
        let loaded = checkpoint::load::<AdamHeader>(path, OPTIMIZER_MAGIC)?;
        if loaded.tensors.len() != params.len() * 2 {
            return Err(CheckpointError::InvalidFormat(format!(
                "optimizer state has {} tensors, expected {}",
                loaded.tensors.len(),
                params.len() * 2
            )));
        }
        let mut tensors = loaded.tensors;
        let v = tensors.split_off(params.len());
        let m = tensors;
        for (slot, param) in params.iter().enumerate() {
            if m[slot].len() != param.len() || v[slot].len() != param.len() {
                return Err(CheckpointError::InvalidFormat(format!(
                    "optimizer state for parameter {slot} has the wrong size"
                )));
            }
        }
        let header = loaded.header;
        Ok(Self {
            beta1: header.beta1,
            beta2: header.beta2,
            eps: header.eps,
            weight_decay: header.weight_decay,
            t: header.step,
            m,
            v,
        })
    }
}

/// Linear decay to zero after an optional linear warmup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate for the optimizer step that follows `step` completed
    /// steps.
    pub fn lr_at(&self, step: u64) -> f64 {
        let step = step as f64;
        let warmup = self.warmup_steps as f64;
        let total = self.total_steps as f64;
        if step < warmup {
            return self.base_lr * step / warmup.max(1.0);
        }
        self.base_lr * ((total - step) / (total - warmup).max(1.0)).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub epoch: usize,
    pub step: u64,
    pub eval_loss: f64,
    pub eval_accuracy: f64,
    pub eval_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Train {
        step: u64,
        epoch: f64,
        loss: f64,
        learning_rate: f64,
    },
    Eval(EvalMetrics),
    Checkpoint {
        step: u64,
        path: PathBuf,
    },
}

/// Receives metric records. Errors are reported but never stop training.
pub trait MetricsSink {
    fn on_record(&mut self, record: &LogRecord) -> io::Result<()>;
}

/// Appends records as JSON lines to `<logging_dir>/metrics.jsonl`.
#[derive(Debug)]
pub struct JsonlMetricsLog {
    path: PathBuf,
}

impl JsonlMetricsLog {
    pub fn new(logging_dir: &Path) -> Self {
        Self {
            path: logging_dir.join(METRICS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Serialize)]
struct TimestampedRecord<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    record: &'a LogRecord,
}

impl MetricsSink for JsonlMetricsLog {
    fn on_record(&mut self, record: &LogRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(&TimestampedRecord {
            timestamp: Utc::now(),
            record,
        })?;
        writeln!(file, "{line}")
    }
}

/// Progress persisted with every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub epochs_completed: usize,
    pub global_step: u64,
    pub log_history: Vec<LogRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutput {
    pub global_step: u64,
    pub train_loss: f64,
    pub evals: Vec<EvalMetrics>,
}

/// Encodes a whole split up front and maps labels through `labels`.
pub fn tokenize_split(
    tokenizer: &Tokenizer,
    split: &Split,
    labels: &LabelMapping,
) -> Result<Vec<TokenizedSample>, TrainingError> {
    let mut out = Vec::new();
    out.try_reserve_exact(split.len()).map_err(|err| {
        TrainingError::ResourceExhausted(format!(
            "cannot hold {} tokenized samples: {err}",
            split.len()
        ))
    })?;

    let texts = split.texts().collect::<Vec<_>>();
    let encodings = tokenizer.encode_batch(&texts);
    for (sample, encoding) in split.samples().iter().zip(encodings) {
        let label = labels
            .encode(sample.label.as_str())
            .ok_or_else(|| TrainingError::UnmappedLabel(sample.label.as_str().to_string()))?;
        out.push(TokenizedSample { encoding, label });
    }
    Ok(out)
}

/// Deterministic batch order for `epoch`.
pub fn epoch_order(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut order = (0..len).collect::<Vec<_>>();
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
    order.shuffle(&mut rng);
    order
}

pub fn checkpoint_dir(output_dir: &Path, step: u64) -> PathBuf {
    output_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
}

/// `checkpoint-<step>` directories in `output_dir`, oldest first.
pub fn list_checkpoints(output_dir: &Path) -> Result<Vec<(u64, PathBuf)>, io::Error> {
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let step = name
            .to_str()
            .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(step) = step {
            found.push((step, entry.path()));
        }
    }
    found.sort_by_key(|(step, _)| *step);
    Ok(found)
}

pub fn latest_checkpoint(output_dir: &Path) -> Result<Option<PathBuf>, io::Error> {
    Ok(list_checkpoints(output_dir)?.pop().map(|(_, path)| path))
}

/// Drives the epoch/batch loop for one run and owns the model while it does.
pub struct Trainer<M: TrainableClassifier> {
    model: M,
    tokenizer: Tokenizer,
    args: TrainingArgs,
    optimizer: Adam,
    state: TrainerState,
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl<M: TrainableClassifier> Trainer<M> {
    pub fn new(model: M, tokenizer: Tokenizer, args: TrainingArgs) -> Result<Self, TrainingError> {
        args.validate()?;
        if tokenizer.vocab_size() != model.config().vocab_size {
            return Err(TrainingError::InvalidArgs(format!(
                "tokenizer vocabulary ({}) does not match the model embedding table ({})",
                tokenizer.vocab_size(),
                model.config().vocab_size
            )));
        }
        let optimizer = Adam::new(model.params(), args.weight_decay);
        Ok(Self {
            model,
            tokenizer,
            args,
            optimizer,
            state: TrainerState::default(),
            sinks: Vec::new(),
        })
    }

    pub fn with_sink(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn into_parts(self) -> (M, Tokenizer) {
        (self.model, self.tokenizer)
    }

    /// Restores weights, optimizer moments and progress from a checkpoint
    /// directory written by this trainer.
    pub fn resume_from(&mut self, dir: &Path) -> Result<(), TrainingError> {
        let mismatch = |reason: &str| TrainingError::ResumeMismatch {
            path: dir.to_path_buf(),
            reason: reason.to_string(),
        };

        let weights = checkpoint::load::<ClassifierConfig>(&dir.join(MODEL_FILE), WEIGHTS_MAGIC)?;
        if &weights.header != self.model.config() {
            return Err(mismatch("model config differs"));
        }
        let tokenizer = Tokenizer::load(&dir.join(TOKENIZER_FILE))?;
        if tokenizer != self.tokenizer {
            return Err(mismatch("tokenizer differs"));
        }
        checkpoint::apply(&weights.tensors, self.model.params_mut())?;
        self.optimizer = Adam::load(&dir.join(OPTIMIZER_FILE), self.model.params())?;

        let raw = fs::read(dir.join(TRAINER_STATE_FILE))?;
        self.state = serde_json::from_slice(&raw)?;
        if self.optimizer.steps() != self.state.global_step {
            return Err(mismatch("optimizer and trainer state disagree on the step"));
        }

        info!(
            checkpoint = %dir.display(),
            epochs_completed = self.state.epochs_completed,
            global_step = self.state.global_step,
            "resumed from checkpoint"
        );
        Ok(())
    }

    pub fn resume_from_latest(&mut self) -> Result<PathBuf, TrainingError> {
        let dir = latest_checkpoint(&self.args.output_dir)?
            .ok_or_else(|| TrainingError::NoCheckpoint(self.args.output_dir.clone()))?;
        self.resume_from(&dir)?;
        Ok(dir)
    }

    pub fn train(
        &mut self,
        train: &[TokenizedSample],
        eval: &[TokenizedSample],
    ) -> Result<TrainOutput, TrainingError> {
        if train.is_empty() {
            return Err(TrainingError::EmptyTrainSplit);
        }
        if self.state.epochs_completed >= self.args.epochs {
            return Err(TrainingError::InvalidArgs(format!(
                "checkpoint already completed {} of {} epochs",
                self.state.epochs_completed, self.args.epochs
            )));
        }
        let steps_per_epoch = self.args.steps_per_epoch(train.len());
        let total_steps = steps_per_epoch * self.args.epochs;
        let schedule = LinearSchedule::new(
            self.args.learning_rate,
            self.args.warmup_steps,
            total_steps,
        );

        info!(
            train_samples = train.len(),
            eval_samples = eval.len(),
            epochs = self.args.epochs,
            batch_size = self.args.train_batch_size,
            total_steps,
            start_epoch = self.state.epochs_completed,
            "starting training"
        );

        let started = Instant::now();
        let mut total = BatchStats::default();
        let mut window = BatchStats::default();
        let mut evals = Vec::new();

        for epoch in self.state.epochs_completed..self.args.epochs {
            let order = epoch_order(train.len(), self.args.seed, epoch);
            for (batch_idx, indices) in order.chunks(self.args.train_batch_size).enumerate() {
                let batch = indices
                    .iter()
                    .map(|&i| train[i].clone())
                    .collect::<Vec<_>>();

                self.model.zero_grad();
                let stats = self.model.backward(&batch)?;
                let step = self.state.global_step + 1;
                if !stats.loss_sum.is_finite() {
                    return Err(TrainingError::Divergence {
                        step,
                        loss: stats.mean_loss(),
                    });
                }

                let lr = schedule.lr_at(self.state.global_step);
                self.optimizer.step(self.model.params_mut(), lr);
                self.state.global_step = step;
                total.merge(stats);
                window.merge(stats);

                if step % self.args.logging_steps as u64 == 0 {
                    let record = LogRecord::Train {
                        step,
                        epoch: epoch as f64 + (batch_idx + 1) as f64 / steps_per_epoch as f64,
                        loss: window.mean_loss(),
                        learning_rate: lr,
                    };
                    info!(step, loss = window.mean_loss(), lr, "train");
                    self.record(record);
                    window = BatchStats::default();
                }
            }

            let metrics = self.evaluate_epoch(eval, epoch + 1)?;
            info!(
                epoch = epoch + 1,
                eval_loss = metrics.eval_loss,
                eval_accuracy = metrics.eval_accuracy,
                "evaluation"
            );
            self.record(LogRecord::Eval(metrics.clone()));
            evals.push(metrics);

            self.state.epochs_completed = epoch + 1;
            let path = self.save_checkpoint()?;
            self.record(LogRecord::Checkpoint {
                step: self.state.global_step,
                path,
            });
        }

        info!(
            global_step = self.state.global_step,
            train_loss = total.mean_loss(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "training finished"
        );
        Ok(TrainOutput {
            global_step: self.state.global_step,
            train_loss: total.mean_loss(),
            evals,
        })
    }

    /// Non-updating pass over `eval` in batches of `eval_batch_size`.
    pub fn evaluate(&self, eval: &[TokenizedSample]) -> Result<BatchStats, TrainingError> {
        let mut stats = BatchStats::default();
        for batch in eval.chunks(self.args.eval_batch_size) {
            stats.merge(self.model.evaluate(batch)?);
        }
        Ok(stats)
    }

    fn evaluate_epoch(
        &self,
        eval: &[TokenizedSample],
        epoch: usize,
    ) -> Result<EvalMetrics, TrainingError> {
        let stats = self.evaluate(eval)?;
        Ok(EvalMetrics {
            epoch,
            step: self.state.global_step,
            eval_loss: stats.mean_loss(),
            eval_accuracy: stats.accuracy(),
            eval_samples: stats.samples,
        })
    }

    fn record(&mut self, record: LogRecord) {
        for sink in &mut self.sinks {
            if let Err(err) = sink.on_record(&record) {
                warn!(error = %err, "failed to write metrics record");
            }
        }
        self.state.log_history.push(record);
    }

    /// Writes `checkpoint-<step>` next to a temporary directory and renames it
    /// into place, then prunes beyond `save_total_limit`.
    fn save_checkpoint(&self) -> Result<PathBuf, TrainingError> {
        fs::create_dir_all(&self.args.output_dir)?;
        let step = self.state.global_step;
        let final_dir = checkpoint_dir(&self.args.output_dir, step);
        let tmp_dir = self
            .args
            .output_dir
            .join(format!(".tmp-{CHECKPOINT_PREFIX}{step}"));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        self.model.save(&tmp_dir.join(MODEL_FILE))?;
        self.optimizer.save(&tmp_dir.join(OPTIMIZER_FILE))?;
        self.tokenizer.save(&tmp_dir.join(TOKENIZER_FILE))?;
        fs::write(
            tmp_dir.join(CONFIG_FILE),
            serde_json::to_vec_pretty(self.model.config())?,
        )?;
        fs::write(
            tmp_dir.join(TRAINER_STATE_FILE),
            serde_json::to_vec_pretty(&self.state)?,
        )?;

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;
        debug!(checkpoint = %final_dir.display(), "saved checkpoint");

        if let Some(limit) = self.args.save_total_limit {
            let checkpoints = list_checkpoints(&self.args.output_dir)?;
            let excess = checkpoints.len().saturating_sub(limit);
            for (_, old) in checkpoints.into_iter().take(excess) {
                debug!(checkpoint = %old.display(), "pruning checkpoint");
                fs::remove_dir_all(old)?;
            }
        }
        Ok(final_dir)
    }
}
