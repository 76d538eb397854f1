//! OpenAI-compatible invoice extraction.
//!
//! Works with any OpenAI-compatible chat completions endpoint, including the
//! OpenAI cloud API, Azure OpenAI, Ollama (OpenAI compatibility mode), vLLM
//! and LM Studio.
//!
//! # Example
//!
//! ```rust,no_run
//! use tally_inference::openai::{OpenAIConfig, OpenAiExtractor};
//!
//! let extractor = OpenAiExtractor::new(OpenAIConfig {
//!     base_url: "http://localhost:11434/v1".to_string(), // Ollama
//!     gen_model: "llama3".to_string(),
//!     ..Default::default()
//! })
//! .unwrap();
//! ```

mod backend;
mod error;
mod types;

pub use backend::{
    OpenAIConfig, OpenAiExtractor, DEFAULT_GEN_MODEL, DEFAULT_OPENAI_URL, DEFAULT_TIMEOUT_SECS,
};
pub use error::ModelRejection;
pub use types::*;
