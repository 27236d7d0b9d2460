//! TOML configuration for training, export and serving.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{tokenizer::FitOptions, training::TrainingArgs};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentimentConfig {
    pub data: DataSection,
    pub tokenizer: TokenizerSection,
    pub model: ModelSection,
    pub training: TrainingArgs,
    pub export: ExportSection,
    pub server: ServerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    /// aclImdb directory, JSONL directory or SQLite file.
    pub corpus: PathBuf,
    pub train_samples: usize,
    pub test_samples: usize,
    pub seed: u64,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            corpus: PathBuf::from("./data/aclImdb"),
            train_samples: 2000,
            test_samples: 1000,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerSection {
    pub max_tokens: usize,
    pub max_vocab: usize,
    pub min_frequency: usize,
    pub oov_buckets: usize,
}

impl Default for TokenizerSection {
    fn default() -> Self {
        let fit = FitOptions::default();
        Self {
            max_tokens: fit.max_length,
            max_vocab: fit.max_vocab,
            min_frequency: fit.min_frequency,
            oov_buckets: fit.oov_buckets,
        }
    }
}

impl TokenizerSection {
    pub fn fit_options(&self) -> FitOptions {
        FitOptions {
            max_vocab: self.max_vocab,
            min_frequency: self.min_frequency,
            oov_buckets: self.oov_buckets,
            max_length: self.max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Previously exported artifact to start from. Its tokenizer is reused.
    pub base_model: Option<PathBuf>,
    pub embed_dim: usize,
    pub hidden_dim: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            base_model: None,
            embed_dim: 64,
            hidden_dim: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSection {
    pub model_dir: PathBuf,
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./sentiment_model"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8000,
        }
    }
}

impl ServerSection {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl SentimentConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.train_samples == 0 {
            return Err(ConfigError::Invalid(
                "data.train_samples must be > 0".to_string(),
            ));
        }
        if self.tokenizer.max_tokens < 2 {
            return Err(ConfigError::Invalid(format!(
                "tokenizer.max_tokens must be >= 2, got {}",
                self.tokenizer.max_tokens
            )));
        }
        if self.model.embed_dim == 0 || self.model.hidden_dim == 0 {
            return Err(ConfigError::Invalid(
                "model dimensions must be > 0".to_string(),
            ));
        }
        self.training
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_run() {
        let config = SentimentConfig::default();
        assert_eq!(config.data.train_samples, 2000);
        assert_eq!(config.data.test_samples, 1000);
        assert_eq!(config.tokenizer.max_tokens, 128);
        assert_eq!(config.training.epochs, 5);
        assert_eq!(config.training.train_batch_size, 16);
        assert_eq!(config.training.eval_batch_size, 16);
        assert_eq!(config.training.logging_steps, 50);
        assert_eq!(config.training.output_dir, PathBuf::from("./results"));
        assert_eq!(config.training.logging_dir, PathBuf::from("./logs"));
        assert_eq!(config.export.model_dir, PathBuf::from("./sentiment_model"));
        assert_eq!(config.server.addr().to_string(), "127.0.0.1:8000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sentiment.toml");
        std::fs::write(
            &path,
            r#"
[data]
corpus = "/srv/reviews.db"
train_samples = 500

[training]
epochs = 2
learning_rate = 0.01
save_total_limit = 3

[server]
port = 9000
"#,
        )
        .expect("write");

        let config = SentimentConfig::load_from_file(&path).expect("load");
        assert_eq!(config.data.corpus, PathBuf::from("/srv/reviews.db"));
        assert_eq!(config.data.train_samples, 500);
        assert_eq!(config.data.test_samples, 1000);
        assert_eq!(config.training.epochs, 2);
        assert_eq!(config.training.save_total_limit, Some(3));
        assert_eq!(config.training.train_batch_size, 16);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.tokenizer.fit_options(), FitOptions::default());
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = SentimentConfig::load(Some(Path::new("/nonexistent/sentiment.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn unparsable_file_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[training]\nepochs = \"many\"\n").expect("write");
        let err = SentimentConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        let mut config = SentimentConfig::default();
        config.tokenizer.max_tokens = 1;
        assert!(config.validate().is_err());

        let mut config = SentimentConfig::default();
        config.training.epochs = 0;
        assert!(config.validate().is_err());

        let mut config = SentimentConfig::default();
        config.training.eval_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SentimentConfig::default();
        config.training.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }
}
