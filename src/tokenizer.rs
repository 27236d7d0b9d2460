use std::{collections::HashMap, fs, path::Path};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PAD_TOKEN: &str = "[PAD]";
pub const UNK_TOKEN: &str = "[UNK]";
pub const CLS_TOKEN: &str = "[CLS]";
pub const SEP_TOKEN: &str = "[SEP]";

pub const PAD_ID: u32 = 0;
pub const UNK_ID: u32 = 1;
pub const CLS_ID: u32 = 2;
pub const SEP_ID: u32 = 3;

const SPECIAL_TOKENS: [&str; 4] = [PAD_TOKEN, UNK_TOKEN, CLS_TOKEN, SEP_TOKEN];
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("max_length must be >= 2 to fit [CLS] and [SEP], got {0}")]
    InvalidMaxLength(usize),
    #[error("vocabulary entry {token:?} appears more than once")]
    DuplicateToken { token: String },
    #[error("vocabulary must start with [PAD], [UNK], [CLS], [SEP]")]
    MissingSpecialTokens,
    #[error("unsupported tokenizer format version {0}")]
    UnsupportedVersion(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FitOptions {
    pub max_vocab: usize,
    pub min_frequency: usize,
    pub oov_buckets: usize,
    pub max_length: usize,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_vocab: 8_192,
            min_frequency: 2,
            oov_buckets: 1_024,
            max_length: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoding {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
}

impl Encoding {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Ids at attended positions, in order.
    pub fn attended_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.input_ids
            .iter()
            .zip(&self.attention_mask)
            .filter(|(_, mask)| **mask == 1)
            .map(|(id, _)| *id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenizerFile {
    version: u32,
    max_length: usize,
    oov_buckets: usize,
    vocab: Vec<String>,
}

/// Uncased word-level tokenizer with a learned vocabulary and hashed
/// out-of-vocabulary buckets.
///
/// Ids `0..vocab.len()` are vocabulary entries (special tokens first), ids
/// `vocab.len()..vocab.len() + oov_buckets` are hash buckets for unseen words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokenizer {
    vocab: Vec<String>,
    index: HashMap<String, u32>,
    oov_buckets: usize,
    max_length: usize,
}

impl Tokenizer {
    pub fn from_vocab(
        vocab: Vec<String>,
        oov_buckets: usize,
        max_length: usize,
    ) -> Result<Self, TokenizerError> {
        if max_length < 2 {
            return Err(TokenizerError::InvalidMaxLength(max_length));
        }
        if vocab.len() < SPECIAL_TOKENS.len()
            || vocab.iter().zip(SPECIAL_TOKENS).any(|(v, s)| v != s)
        {
            return Err(TokenizerError::MissingSpecialTokens);
        }

        let mut index = HashMap::with_capacity(vocab.len());
        for (id, token) in vocab.iter().enumerate() {
            if index.insert(token.clone(), id as u32).is_some() {
                return Err(TokenizerError::DuplicateToken {
                    token: token.clone(),
                });
            }
        }

        Ok(Self {
            vocab,
            index,
            oov_buckets,
            max_length,
        })
    }

    /// Learns a vocabulary from `texts`. Words are ranked by frequency, ties
    /// broken alphabetically, so the result does not depend on input order.
    pub fn fit<'a, I>(texts: I, options: FitOptions) -> Result<Self, TokenizerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for text in texts {
            for word in split_words(text) {
                *counts.entry(word).or_default() += 1;
            }
        }

        let mut ranked = counts
            .into_iter()
            .filter(|(word, count)| {
                *count >= options.min_frequency.max(1) && !SPECIAL_TOKENS.contains(&word.as_str())
            })
            .collect::<Vec<_>>();
        ranked.sort_by(|(wa, ca), (wb, cb)| cb.cmp(ca).then_with(|| wa.cmp(wb)));

        let budget = options.max_vocab.saturating_sub(SPECIAL_TOKENS.len());
        let vocab = SPECIAL_TOKENS
            .iter()
            .map(|s| s.to_string())
            .chain(ranked.into_iter().take(budget).map(|(word, _)| word))
            .collect();

        Self::from_vocab(vocab, options.oov_buckets, options.max_length)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len() + self.oov_buckets
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn oov_buckets(&self) -> usize {
        self.oov_buckets
    }

    pub fn token_id(&self, word: &str) -> u32 {
        if let Some(id) = self.index.get(word) {
            return *id;
        }
        if self.oov_buckets == 0 {
            return UNK_ID;
        }
        let bucket = fnv1a_hash(word.as_bytes()) % self.oov_buckets as u64;
        (self.vocab.len() as u64 + bucket) as u32
    }

    pub fn id_to_token(&self, id: u32) -> Option<&str> {
        self.vocab.get(id as usize).map(String::as_str)
    }

    /// `[CLS] words… [SEP]` truncated and padded to exactly `max_length`.
    pub fn encode(&self, text: &str) -> Encoding {
        let budget = self.max_length - 2;
        let mut input_ids = Vec::with_capacity(self.max_length);
        input_ids.push(CLS_ID);
        input_ids.extend(
            split_words(text)
                .into_iter()
                .take(budget)
                .map(|word| self.token_id(&word)),
        );
        input_ids.push(SEP_ID);

        let attended = input_ids.len();
        input_ids.resize(self.max_length, PAD_ID);
        let mut attention_mask = vec![1_u8; attended];
        attention_mask.resize(self.max_length, 0);

        Encoding {
            input_ids,
            attention_mask,
        }
    }

    pub fn encode_batch<S: AsRef<str> + Sync>(&self, texts: &[S]) -> Vec<Encoding> {
        texts.par_iter().map(|text| self.encode(text.as_ref())).collect()
    }

    pub fn save(&self, path: &Path) -> Result<(), TokenizerError> {
        let file = TokenizerFile {
            version: FORMAT_VERSION,
            max_length: self.max_length,
            oov_buckets: self.oov_buckets,
            vocab: self.vocab.clone(),
        };
        fs::write(path, serde_json::to_vec_pretty(&file)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, TokenizerError> {
        let file: TokenizerFile = serde_json::from_slice(&fs::read(path)?)?;
        if file.version != FORMAT_VERSION {
            return Err(TokenizerError::UnsupportedVersion(file.version));
        }
        Self::from_vocab(file.vocab, file.oov_buckets, file.max_length)
    }
}

/// Lowercased words. HTML line breaks count as whitespace; `!` and `?` are
/// kept as their own tokens since they carry sentiment.
pub fn split_words(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase().replace("<br />", " ").replace("<br/>", " ");
    let mut words = Vec::new();
    let mut current = String::new();
    for ch in lowered.chars() {
        if ch.is_alphanumeric() || ch == '\'' {
            current.push(ch);
            continue;
        }
        if !current.is_empty() {
            words.push(trim_apostrophes(&current));
            current.clear();
        }
        if ch == '!' || ch == '?' {
            words.push(ch.to_string());
        }
    }
    if !current.is_empty() {
        words.push(trim_apostrophes(&current));
    }
    words.retain(|w| !w.is_empty());
    words
}

fn trim_apostrophes(word: &str) -> String {
    word.trim_matches('\'').to_string()
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
