use std::{fs, path::Path};

use sentiment::config::SentimentConfig;

const NOUNS: [&str; 8] = [
    "class", "subject", "movie", "film", "lecture", "course", "book", "show",
];
const GOOD: [&str; 4] = ["great", "wonderful", "excellent", "brilliant"];
const BAD: [&str; 4] = ["terrible", "awful", "boring", "dreadful"];

/// Small review corpus where only the sentiment words separate the classes.
pub fn synthetic_reviews() -> Vec<(String, &'static str)> {
    let mut rows = Vec::new();
    for noun in NOUNS {
        rows.push((format!("I really love this {noun}!"), "POSITIVE"));
        rows.push((format!("I really hate this {noun}."), "NEGATIVE"));
        rows.push((format!("Honestly, I love the {noun}."), "POSITIVE"));
        rows.push((format!("Honestly, I disliked the {noun}."), "NEGATIVE"));
        for (good, bad) in GOOD.iter().zip(BAD) {
            rows.push((format!("This {noun} is {good}."), "POSITIVE"));
            rows.push((format!("What a {bad} {noun}, I wanted to leave"), "NEGATIVE"));
            rows.push((format!("The {noun} was {good}, I would recommend it"), "POSITIVE"));
            rows.push((format!("This {noun} is {bad}."), "NEGATIVE"));
        }
    }
    rows
}

/// Writes `train.jsonl` and `test.jsonl` under `dir`, every fifth row going to
/// the test split.
pub fn write_jsonl_corpus(dir: &Path) {
    fs::create_dir_all(dir).expect("corpus dir");
    let mut train = String::new();
    let mut test = String::new();
    for (idx, (text, label)) in synthetic_reviews().into_iter().enumerate() {
        let line = serde_json::json!({ "text": text, "label": label }).to_string();
        let target = if idx % 5 == 0 { &mut test } else { &mut train };
        target.push_str(&line);
        target.push('\n');
    }
    fs::write(dir.join("train.jsonl"), train).expect("train.jsonl");
    fs::write(dir.join("test.jsonl"), test).expect("test.jsonl");
}

pub fn small_run_config(root: &Path) -> SentimentConfig {
    let corpus = root.join("corpus");
    write_jsonl_corpus(&corpus);

    let mut config = SentimentConfig::default();
    config.data.corpus = corpus;
    config.model.embed_dim = 16;
    config.model.hidden_dim = 16;
    config.training.epochs = 6;
    config.training.train_batch_size = 8;
    config.training.eval_batch_size = 8;
    config.training.learning_rate = 0.02;
    config.training.logging_steps = 10;
    config.training.output_dir = root.join("results");
    config.training.logging_dir = root.join("logs");
    config.export.model_dir = root.join("sentiment_model");
    config
}
