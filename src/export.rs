use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    model::{ModelError, TrainableClassifier},
    tokenizer::{Tokenizer, TokenizerError},
    training::{CONFIG_FILE, MODEL_FILE, TOKENIZER_FILE},
};

pub const MANIFEST_FILE: &str = "artifact.json";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write artifact at {path}: {reason}")]
    Write { path: PathBuf, reason: String },
    #[error("artifact at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ExportError {
    fn write(path: &Path, reason: impl ToString) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    fn corrupt(path: &Path, reason: impl ToString) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Weights,
    Config,
    Tokenizer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub kind: ArtifactKind,
    pub name: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetrics {
    pub train_loss: Option<f64>,
    pub eval_loss: Option<f64>,
    pub eval_accuracy: Option<f64>,
    pub steps: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub architecture: String,
    #[serde(default)]
    pub metrics: ArtifactMetrics,
    pub files: Vec<ArtifactFile>,
}

/// Model and tokenizer restored from one artifact directory.
#[derive(Debug)]
pub struct Artifact<M> {
    pub model: M,
    pub tokenizer: Tokenizer,
    pub manifest: ArtifactManifest,
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn export<M: TrainableClassifier>(
    model: &M,
    tokenizer: &Tokenizer,
    destination: &Path,
) -> Result<ArtifactManifest, ExportError> {
    export_with_metrics(model, tokenizer, destination, ArtifactMetrics::default())
}

/// Writes the artifact into a sibling staging directory and swaps it into
/// `destination`. A crash between the two renames leaves the previous
/// artifact in the `.{name}.old` backup, which [`recover_interrupted`] moves
/// back on the next export or load.
pub fn export_with_metrics<M: TrainableClassifier>(
    model: &M,
    tokenizer: &Tokenizer,
    destination: &Path,
    metrics: ArtifactMetrics,
) -> Result<ArtifactManifest, ExportError> {
    let siblings = Siblings::of(destination)?;
    fs::create_dir_all(&siblings.parent).map_err(|err| ExportError::write(&siblings.parent, err))?;
    recover_interrupted(destination)?;

    let Siblings {
        parent,
        staging,
        backup,
    } = siblings;
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|err| ExportError::write(&staging, err))?;
    }
    fs::create_dir_all(&staging).map_err(|err| ExportError::write(&staging, err))?;

    let manifest = match write_staging(model, tokenizer, &staging, metrics) {
        Ok(manifest) => manifest,
        Err(err) => {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!(staging = %staging.display(), error = %cleanup, "failed to remove staging directory");
            }
            return Err(err);
        }
    };

    let replaced = destination.exists();
    if replaced {
        fs::rename(destination, &backup).map_err(|err| ExportError::write(destination, err))?;
    }
    if let Err(err) = fs::rename(&staging, destination) {
        if replaced {
            if let Err(restore) = fs::rename(&backup, destination) {
                warn!(backup = %backup.display(), error = %restore, "failed to restore previous artifact");
            }
        }
        return Err(ExportError::write(destination, err));
    }
    sync_dir(&parent);

    if replaced {
        if let Err(err) = fs::remove_dir_all(&backup) {
            warn!(backup = %backup.display(), error = %err, "failed to remove previous artifact");
        }
    }

    info!(
        destination = %destination.display(),
        files = manifest.files.len(),
        replaced,
        "exported model artifact"
    );
    Ok(manifest)
}

/// Staging and backup directories that sit next to an artifact directory.
struct Siblings {
    parent: PathBuf,
    staging: PathBuf,
    backup: PathBuf,
}

impl Siblings {
    fn of(destination: &Path) -> Result<Self, ExportError> {
        let name = destination
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ExportError::write(destination, "destination has no file name"))?;
        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self {
            staging: parent.join(format!(".{name}.staging")),
            backup: parent.join(format!(".{name}.old")),
            parent,
        })
    }
}

/// Repairs what an export interrupted mid-swap leaves behind. With
/// `destination` missing, the backup of the previous artifact is renamed
/// back; with both present, the backup is stale and gets removed.
pub fn recover_interrupted(destination: &Path) -> Result<(), ExportError> {
    let Siblings { backup, .. } = Siblings::of(destination)?;
    if !backup.exists() {
        return Ok(());
    }
    if destination.exists() {
        debug!(backup = %backup.display(), "removing stale artifact backup");
        fs::remove_dir_all(&backup).map_err(|err| ExportError::write(&backup, err))?;
    } else {
        warn!(
            destination = %destination.display(),
            backup = %backup.display(),
            "restoring artifact left behind by an interrupted export"
        );
        fs::rename(&backup, destination).map_err(|err| ExportError::write(destination, err))?;
    }
    Ok(())
}

fn write_staging<M: TrainableClassifier>(
    model: &M,
    tokenizer: &Tokenizer,
    staging: &Path,
    metrics: ArtifactMetrics,
) -> Result<ArtifactManifest, ExportError> {
    let weights = staging.join(MODEL_FILE);
    model
        .save(&weights)
        .map_err(|err| ExportError::write(&weights, err))?;

    let config = staging.join(CONFIG_FILE);
    let config_json = serde_json::to_vec_pretty(model.config())
        .map_err(|err| ExportError::write(&config, err))?;
    write_synced(&config, &config_json)?;

    let tokenizer_path = staging.join(TOKENIZER_FILE);
    tokenizer
        .save(&tokenizer_path)
        .map_err(|err| ExportError::write(&tokenizer_path, err))?;
    File::open(&tokenizer_path)
        .and_then(|f| f.sync_all())
        .map_err(|err| ExportError::write(&tokenizer_path, err))?;

    let mut files = Vec::new();
    for (kind, name) in [
        (ArtifactKind::Weights, MODEL_FILE),
        (ArtifactKind::Config, CONFIG_FILE),
        (ArtifactKind::Tokenizer, TOKENIZER_FILE),
    ] {
        let path = staging.join(name);
        let sha256 = sha256_file(&path).map_err(|err| ExportError::write(&path, err))?;
        debug!(file = name, %sha256, "staged artifact file");
        files.push(ArtifactFile {
            kind,
            name: name.to_string(),
            sha256,
        });
    }

    let manifest = ArtifactManifest {
        version: MANIFEST_VERSION,
        created_at: Utc::now(),
        architecture: model.config().architecture.clone(),
        metrics,
        files,
    };
    let manifest_path = staging.join(MANIFEST_FILE);
    let manifest_json = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| ExportError::write(&manifest_path, err))?;
    write_synced(&manifest_path, &manifest_json)?;
    sync_dir(staging);
    Ok(manifest)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), ExportError> {
    use std::io::Write;

    let mut file = File::create(path).map_err(|err| ExportError::write(path, err))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|err| ExportError::write(path, err))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), error = %err, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

pub fn read_manifest(dir: &Path) -> Result<ArtifactManifest, ExportError> {
    let path = dir.join(MANIFEST_FILE);
    let raw = fs::read(&path).map_err(|err| ExportError::corrupt(dir, format!("{MANIFEST_FILE}: {err}")))?;
    let manifest: ArtifactManifest =
        serde_json::from_slice(&raw).map_err(|err| ExportError::corrupt(dir, err))?;
    if manifest.version != MANIFEST_VERSION {
        return Err(ExportError::corrupt(
            dir,
            format!("unsupported manifest version {}", manifest.version),
        ));
    }
    Ok(manifest)
}

/// Checks every file listed in the manifest against its recorded digest.
pub fn verify(dir: &Path) -> Result<ArtifactManifest, ExportError> {
    let manifest = read_manifest(dir)?;
    for required in [MODEL_FILE, CONFIG_FILE, TOKENIZER_FILE] {
        if !manifest.files.iter().any(|f| f.name == required) {
            return Err(ExportError::corrupt(
                dir,
                format!("manifest does not list {required}"),
            ));
        }
    }
    for file in &manifest.files {
        let path = dir.join(&file.name);
        let actual =
            sha256_file(&path).map_err(|err| ExportError::corrupt(dir, format!("{}: {err}", file.name)))?;
        if actual != file.sha256 {
            return Err(ExportError::corrupt(
                dir,
                format!("checksum mismatch for {}", file.name),
            ));
        }
    }
    Ok(manifest)
}

pub fn load_artifact<M: TrainableClassifier>(dir: &Path) -> Result<Artifact<M>, ExportError> {
    recover_interrupted(dir)?;
    let manifest = verify(dir)?;
    let model = M::load(&dir.join(MODEL_FILE))?;
    let tokenizer = Tokenizer::load(&dir.join(TOKENIZER_FILE))?;

    let config_raw = fs::read(dir.join(CONFIG_FILE))?;
    let config: crate::model::ClassifierConfig =
        serde_json::from_slice(&config_raw).map_err(|err| ExportError::corrupt(dir, err))?;
    if &config != model.config() {
        return Err(ExportError::corrupt(
            dir,
            "config.json disagrees with the weights header",
        ));
    }
    if tokenizer.vocab_size() != config.vocab_size {
        return Err(ExportError::corrupt(
            dir,
            format!(
                "tokenizer has {} ids but the model embeds {}",
                tokenizer.vocab_size(),
                config.vocab_size
            ),
        ));
    }

    debug!(artifact = %dir.display(), "loaded model artifact");
    Ok(Artifact {
        model,
        tokenizer,
        manifest,
    })
}
