pub mod autograd;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod export;
pub mod finetune;
pub mod model;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod tokenizer;
pub mod training;
