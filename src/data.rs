use std::{
    collections::{BTreeMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("corpus unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },
    #[error("malformed record in {source_name} at {position}: {reason}")]
    Malformed {
        source_name: String,
        position: usize,
        reason: String,
    },
    #[error("unknown label {0:?}")]
    UnknownLabel(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Label {
    Negative,
    Positive,
}

impl Label {
    pub const ALL: [Label; 2] = [Label::Negative, Label::Positive];

    pub fn as_str(self) -> &'static str {
        match self {
            Label::Negative => "NEGATIVE",
            Label::Positive => "POSITIVE",
        }
    }

    pub fn from_id(id: u64) -> Option<Self> {
        match id {
            0 => Some(Label::Negative),
            1 => Some(Label::Positive),
            _ => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEGATIVE" | "NEG" => Ok(Label::Negative),
            "POSITIVE" | "POS" => Ok(Label::Positive),
            _ => Err(DataError::UnknownLabel(s.to_string())),
        }
    }
}

/// Bidirectional class-name mapping stored in the model configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapping {
    pub id2label: BTreeMap<usize, String>,
    pub label2id: BTreeMap<String, usize>,
}

impl LabelMapping {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut id2label = BTreeMap::new();
        let mut label2id = BTreeMap::new();
        for (id, name) in names.into_iter().enumerate() {
            let name = name.into();
            id2label.insert(id, name.clone());
            label2id.insert(name, id);
        }
        Self { id2label, label2id }
    }

    pub fn sentiment() -> Self {
        Self::new(Label::ALL.iter().map(|l| l.as_str()))
    }

    pub fn len(&self) -> usize {
        self.id2label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id2label.is_empty()
    }

    pub fn encode(&self, label: &str) -> Option<usize> {
        self.label2id.get(label).copied()
    }

    pub fn decode(&self, id: usize) -> Option<&str> {
        self.id2label.get(&id).map(String::as_str)
    }

    /// Both directions describe the same dense `0..n` assignment.
    pub fn is_consistent(&self) -> bool {
        self.id2label.len() == self.label2id.len()
            && self.id2label.keys().copied().eq(0..self.id2label.len())
            && self
                .id2label
                .iter()
                .all(|(id, name)| self.label2id.get(name) == Some(id))
    }
}

impl Default for LabelMapping {
    fn default() -> Self {
        Self::sentiment()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sample {
    pub text: String,
    pub label: Label,
}

/// Ordered subset of the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Split {
    samples: Vec<Sample>,
}

impl Split {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Deterministic permutation: the same seed always yields the same order.
    pub fn shuffled(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.samples.shuffle(&mut rng);
        self
    }

    /// Keeps the first `n` samples (all of them when `n` exceeds the length).
    pub fn select(mut self, n: usize) -> Self {
        self.samples.truncate(n);
        self
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|s| s.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corpus {
    pub train: Split,
    pub test: Split,
}

impl Corpus {
    /// Shuffles both splits with `seed`, keeps `train_samples` training rows,
    /// then keeps up to `test_samples` test rows whose text does not occur in
    /// the selected training rows.
    pub fn subsample(self, train_samples: usize, test_samples: usize, seed: u64) -> Self {
        let train = self.train.shuffled(seed).select(train_samples);
        let seen = train.texts().collect::<HashSet<_>>();

        let shuffled_test = self.test.shuffled(seed);
        let before = shuffled_test.len();
        let kept = shuffled_test
            .samples
            .into_iter()
            .filter(|s| !seen.contains(s.text.as_str()))
            .collect::<Vec<_>>();
        let dropped = before - kept.len();
        if dropped > 0 {
            warn!(dropped, "dropped test samples that also occur in the train split");
        }
        let test = Split::new(kept).select(test_samples);

        info!(
            train = train.len(),
            test = test.len(),
            seed,
            "selected corpus subsample"
        );
        Self { train, test }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusFormat {
    /// `<root>/{train,test}/{neg,pos}/*.txt`
    AclImdb,
    /// `<root>/train.jsonl` and `<root>/test.jsonl`
    Jsonl,
    /// `reviews(text, label, split)` table
    Sqlite,
}

impl CorpusFormat {
    pub fn detect(path: &Path) -> Result<Self, DataError> {
        if path.is_file() {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            return match ext.as_deref() {
                Some("db" | "sqlite" | "sqlite3") => Ok(Self::Sqlite),
                _ => Err(unavailable(path, "file is not a SQLite corpus")),
            };
        }
        if path.join("train.jsonl").is_file() && path.join("test.jsonl").is_file() {
            return Ok(Self::Jsonl);
        }
        if path.join("train").join("pos").is_dir() && path.join("test").join("pos").is_dir() {
            return Ok(Self::AclImdb);
        }
        if path.exists() {
            Err(unavailable(path, "unrecognised corpus layout"))
        } else {
            Err(unavailable(path, "path does not exist"))
        }
    }
}

pub fn load_corpus(path: &Path) -> Result<Corpus, DataError> {
    let format = CorpusFormat::detect(path)?;
    debug!(path = %path.display(), ?format, "loading corpus");
    let corpus = match format {
        CorpusFormat::AclImdb => Corpus {
            train: load_acl_split(&path.join("train"))?,
            test: load_acl_split(&path.join("test"))?,
        },
        CorpusFormat::Jsonl => Corpus {
            train: load_jsonl_split(&path.join("train.jsonl"))?,
            test: load_jsonl_split(&path.join("test.jsonl"))?,
        },
        CorpusFormat::Sqlite => load_sqlite(path)?,
    };

    if corpus.train.is_empty() || corpus.test.is_empty() {
        return Err(unavailable(path, "train or test split is empty"));
    }
    info!(
        path = %path.display(),
        train = corpus.train.len(),
        test = corpus.test.len(),
        "loaded corpus"
    );
    Ok(corpus)
}

fn unavailable(path: &Path, reason: impl Into<String>) -> DataError {
    DataError::Unavailable {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn load_acl_split(dir: &Path) -> Result<Split, DataError> {
    let mut samples = Vec::new();
    for (sub, label) in [("neg", Label::Negative), ("pos", Label::Positive)] {
        let class_dir = dir.join(sub);
        let mut files = fs::read_dir(&class_dir)
            .map_err(|err| unavailable(&class_dir, err.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
            .collect::<Vec<_>>();
        files.sort();
        for file in files {
            let bytes = fs::read(&file)?;
            let text = String::from_utf8(bytes).map_err(|err| DataError::Malformed {
                source_name: file.display().to_string(),
                position: err.utf8_error().valid_up_to(),
                reason: "review is not valid UTF-8".to_string(),
            })?;
            samples.push(Sample { text, label });
        }
    }
    Ok(Split::new(samples))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLabel {
    Id(u64),
    Name(String),
}

#[derive(Deserialize)]
struct JsonlRecord {
    text: String,
    label: RawLabel,
}

fn load_jsonl_split(file: &Path) -> Result<Split, DataError> {
    let raw = fs::read_to_string(file).map_err(|err| unavailable(file, err.to_string()))?;
    let source_name = file.display().to_string();
    let mut samples = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |reason: String| DataError::Malformed {
            source_name: source_name.clone(),
            position: idx + 1,
            reason,
        };
        let record: JsonlRecord =
            serde_json::from_str(line).map_err(|err| malformed(err.to_string()))?;
        let label = match record.label {
            RawLabel::Id(id) => {
                Label::from_id(id).ok_or_else(|| malformed(format!("label id {id}")))?
            }
            RawLabel::Name(name) => name.parse()?,
        };
        samples.push(Sample {
            text: record.text,
            label,
        });
    }
    Ok(Split::new(samples))
}

fn load_sqlite(path: &Path) -> Result<Corpus, DataError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|err| unavailable(path, err.to_string()))?;
    let mut stmt = conn.prepare(
        "SELECT rowid, text, label FROM reviews
         WHERE split = ?1
         ORDER BY rowid ASC",
    )?;

    let source_name = path.display().to_string();
    let mut read_split = |split: &str| -> Result<Split, DataError> {
        let mut rows = stmt.query(rusqlite::params![split])?;
        let mut samples = Vec::new();
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let text: String = row.get(1)?;
            let label_id: i64 = row.get(2)?;
            let label = u64::try_from(label_id)
                .ok()
                .and_then(Label::from_id)
                .ok_or_else(|| DataError::Malformed {
                    source_name: source_name.clone(),
                    position: rowid as usize,
                    reason: format!("label id {label_id}"),
                })?;
            samples.push(Sample { text, label });
        }
        Ok(Split::new(samples))
    };

    let train = read_split("train")?;
    let test = read_split("test")?;
    Ok(Corpus { train, test })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(text: &str, label: Label) -> Sample {
        Sample {
            text: text.to_string(),
            label,
        }
    }

    fn numbered_split(prefix: &str, n: usize) -> Split {
        Split::new(
            (0..n)
                .map(|i| {
                    let label = if i % 2 == 0 {
                        Label::Negative
                    } else {
                        Label::Positive
                    };
                    sample(&format!("{prefix} review {i}"), label)
                })
                .collect(),
        )
    }

    #[test]
    fn label_mapping_round_trips() {
        let mapping = LabelMapping::sentiment();
        let id = mapping.encode("POSITIVE").expect("encode");
        assert_eq!(id, 1);
        assert_eq!(mapping.decode(id), Some("POSITIVE"));
        assert_eq!(mapping.decode(0), Some("NEGATIVE"));
        assert!(mapping.is_consistent());
    }

    #[test]
    fn label_mapping_serializes_integer_keys() {
        let mapping = LabelMapping::sentiment();
        let json = serde_json::to_string(&mapping).expect("serialize");
        assert!(json.contains("\"0\":\"NEGATIVE\""));
        let back: LabelMapping = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, mapping);
    }

    #[test]
    fn inconsistent_mapping_is_detected() {
        let mut mapping = LabelMapping::sentiment();
        mapping.label2id.insert("POSITIVE".to_string(), 0);
        assert!(!mapping.is_consistent());
    }

    #[test]
    fn labels_parse_from_names() {
        assert_eq!("positive".parse::<Label>().expect("parse"), Label::Positive);
        assert_eq!("NEG".parse::<Label>().expect("parse"), Label::Negative);
        assert!("neutral".parse::<Label>().is_err());
    }

    #[test]
    fn same_seed_yields_same_selection() {
        let a = numbered_split("x", 50).shuffled(42).select(10);
        let b = numbered_split("x", 50).shuffled(42).select(10);
        let c = numbered_split("x", 50).shuffled(7).select(10);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn select_beyond_length_keeps_everything() {
        let split = numbered_split("x", 3).select(10);
        assert_eq!(split.len(), 3);
    }

    #[test]
    fn subsample_is_deterministic_and_disjoint() {
        let mut test = numbered_split("test", 20).samples().to_vec();
        // Cross-split duplicates must never reach the test selection.
        test.extend(numbered_split("train", 30).samples().iter().cloned());
        let corpus = Corpus {
            train: numbered_split("train", 30),
            test: Split::new(test),
        };

        let first = corpus.clone().subsample(30, 15, 42);
        let second = corpus.subsample(30, 15, 42);
        assert_eq!(first, second);

        let train = first.train.samples().iter().collect::<HashSet<_>>();
        assert!(first.test.samples().iter().all(|s| !train.contains(s)));
        assert_eq!(first.test.len(), 15);
    }

    #[test]
    fn loads_acl_imdb_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        for split in ["train", "test"] {
            for (sub, text) in [("neg", "awful"), ("pos", "wonderful")] {
                let class_dir = dir.path().join(split).join(sub);
                fs::create_dir_all(&class_dir).expect("mkdir");
                fs::write(class_dir.join("1_1.txt"), format!("{split} {text} one")).expect("write");
                fs::write(class_dir.join("0_2.txt"), format!("{split} {text} zero")).expect("write");
            }
        }

        let corpus = load_corpus(dir.path()).expect("load");
        assert_eq!(corpus.train.len(), 4);
        assert_eq!(corpus.test.len(), 4);
        assert_eq!(corpus.train.samples()[0], sample("train awful zero", Label::Negative));
        assert_eq!(corpus.train.samples()[3].label, Label::Positive);
    }

    #[test]
    fn non_utf8_review_names_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        for split in ["train", "test"] {
            for sub in ["neg", "pos"] {
                let class_dir = dir.path().join(split).join(sub);
                fs::create_dir_all(&class_dir).expect("mkdir");
                fs::write(class_dir.join("0_1.txt"), "fine").expect("write");
            }
        }
        let bad = dir.path().join("train").join("pos").join("9_9.txt");
        fs::write(&bad, [b'o', b'k', 0xff, 0xfe]).expect("write");

        let err = load_corpus(dir.path()).unwrap_err();
        match err {
            DataError::Malformed {
                source_name,
                position,
                ..
            } => {
                assert!(source_name.ends_with("9_9.txt"), "{source_name}");
                assert_eq!(position, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn loads_jsonl_with_numeric_and_named_labels() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("train.jsonl"),
            "{\"text\": \"good\", \"label\": 1}\n\n{\"text\": \"bad\", \"label\": \"NEGATIVE\"}\n",
        )
        .expect("write");
        fs::write(
            dir.path().join("test.jsonl"),
            "{\"text\": \"fine\", \"label\": 1}\n",
        )
        .expect("write");

        let corpus = load_corpus(dir.path()).expect("load");
        assert_eq!(
            corpus.train.samples(),
            &[sample("good", Label::Positive), sample("bad", Label::Negative)]
        );
        assert_eq!(corpus.test.len(), 1);
    }

    #[test]
    fn malformed_jsonl_reports_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("train.jsonl"), "{\"text\": \"ok\", \"label\": 7}\n")
            .expect("write");
        fs::write(dir.path().join("test.jsonl"), "").expect("write");

        let err = load_corpus(dir.path()).unwrap_err();
        assert!(matches!(err, DataError::Malformed { position: 1, .. }));
    }

    #[test]
    fn loads_sqlite_corpus() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reviews.db");
        {
            let conn = Connection::open(&path).expect("open");
            conn.execute_batch(
                "CREATE TABLE reviews (text TEXT NOT NULL, label INTEGER NOT NULL, split TEXT NOT NULL);
                 INSERT INTO reviews (text, label, split) VALUES ('loved it', 1, 'train');
                 INSERT INTO reviews (text, label, split) VALUES ('hated it', 0, 'train');
                 INSERT INTO reviews (text, label, split) VALUES ('meh', 0, 'test');",
            )
            .expect("seed");
        }

        let corpus = load_corpus(&path).expect("load");
        assert_eq!(
            corpus.train.samples(),
            &[sample("loved it", Label::Positive), sample("hated it", Label::Negative)]
        );
        assert_eq!(corpus.test.samples(), &[sample("meh", Label::Negative)]);
    }

    #[test]
    fn missing_corpus_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_corpus(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, DataError::Unavailable { .. }));
    }

    #[test]
    fn empty_split_is_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("train.jsonl"), "{\"text\": \"a\", \"label\": 0}\n")
            .expect("write");
        fs::write(dir.path().join("test.jsonl"), "\n").expect("write");
        let err = load_corpus(dir.path()).unwrap_err();
        assert!(matches!(err, DataError::Unavailable { .. }));
    }
}
