use std::{net::IpAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sentiment::{
    config::SentimentConfig,
    finetune::{self, ResumeFrom},
    pipeline::SentimentPipeline,
    server,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SMOKE_SENTENCES: [&str; 2] = ["I really love this class!", "This subject is terrible."];

#[derive(Debug, Parser)]
#[command(name = "sentiment", version, about = "Fine-tune, check and serve a sentiment classifier")]
struct Cli {
    /// TOML configuration file. Flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fine-tune on a labeled corpus and export the artifact.
    Train(TrainArgs),
    /// Print predictions for two fixed sentences.
    Smoke {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Serve `POST /predict` from an exported artifact.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct TrainArgs {
    #[arg(long)]
    corpus: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    train_samples: Option<usize>,
    #[arg(long)]
    test_samples: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    max_tokens: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    warmup_steps: Option<usize>,
    #[arg(long)]
    logging_steps: Option<usize>,
    #[arg(long)]
    save_total_limit: Option<usize>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    logging_dir: Option<PathBuf>,
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long)]
    base_model: Option<PathBuf>,
    /// Checkpoint directory to resume from, or `latest`.
    #[arg(long)]
    resume_from_checkpoint: Option<String>,
}

impl TrainArgs {
    fn apply(&self, config: &mut SentimentConfig) {
        if let Some(corpus) = &self.corpus {
            config.data.corpus = corpus.clone();
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.train_batch_size = batch_size;
            config.training.eval_batch_size = batch_size;
        }
        if let Some(n) = self.train_samples {
            config.data.train_samples = n;
        }
        if let Some(n) = self.test_samples {
            config.data.test_samples = n;
        }
        if let Some(seed) = self.seed {
            config.data.seed = seed;
            config.training.seed = seed;
        }
        if let Some(max_tokens) = self.max_tokens {
            config.tokenizer.max_tokens = max_tokens;
        }
        if let Some(lr) = self.learning_rate {
            config.training.learning_rate = lr;
        }
        if let Some(steps) = self.warmup_steps {
            config.training.warmup_steps = steps;
        }
        if let Some(steps) = self.logging_steps {
            config.training.logging_steps = steps;
        }
        if let Some(limit) = self.save_total_limit {
            config.training.save_total_limit = Some(limit);
        }
        if let Some(dir) = &self.output_dir {
            config.training.output_dir = dir.clone();
        }
        if let Some(dir) = &self.logging_dir {
            config.training.logging_dir = dir.clone();
        }
        if let Some(dir) = &self.model_dir {
            config.export.model_dir = dir.clone();
        }
        if let Some(base) = &self.base_model {
            config.model.base_model = Some(base.clone());
        }
    }

    fn resume(&self) -> Option<ResumeFrom> {
        self.resume_from_checkpoint.as_deref().map(|value| match value {
            "latest" => ResumeFrom::Latest,
            path => ResumeFrom::Path(PathBuf::from(path)),
        })
    }
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long)]
    host: Option<IpAddr>,
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentiment=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SentimentConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Train(args) => {
            args.apply(&mut config);
            config.validate().context("invalid configuration")?;
            let report = finetune::fine_tune(&config, args.resume().as_ref())
                .context("fine-tuning failed")?;
            info!(
                train_samples = report.train_samples,
                test_samples = report.test_samples,
                steps = report.output.global_step,
                train_loss = report.output.train_loss,
                model_dir = %config.export.model_dir.display(),
                "done"
            );
            if let Some(eval) = report.output.evals.last() {
                println!(
                    "eval_loss={:.4} eval_accuracy={:.4}",
                    eval.eval_loss, eval.eval_accuracy
                );
            }
        }
        Command::Smoke { model_dir } => {
            let dir = model_dir.unwrap_or(config.export.model_dir);
            let pipeline: SentimentPipeline = SentimentPipeline::from_artifact(&dir)
                .with_context(|| format!("loading model from {}", dir.display()))?;
            for text in SMOKE_SENTENCES {
                let prediction = pipeline.predict(text)?;
                println!("{text}: {}", serde_json::to_string(&[prediction])?);
            }
        }
        Command::Serve(args) => {
            let dir = args.model_dir.unwrap_or(config.export.model_dir);
            if let Some(host) = args.host {
                config.server.host = host;
            }
            if let Some(port) = args.port {
                config.server.port = port;
            }

            let pipeline: SentimentPipeline = SentimentPipeline::from_artifact(&dir)
                .with_context(|| format!("loading model from {}", dir.display()))?;
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("starting async runtime")?;
            runtime.block_on(server::run(config.server.addr(), Arc::new(pipeline)))?;
        }
    }

    Ok(())
}
