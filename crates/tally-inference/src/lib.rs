//! # tally-inference
//!
//! AI invoice extraction for the tally pipeline.
//!
//! [`OpenAiExtractor`] implements [`tally_core::Extractor`]: it turns an
//! attachment into text ([`document`]), asks an OpenAI-compatible model for
//! a JSON array of invoices ([`prompt`]) and parses the reply.
//! [`PatternExtractor`] reads labelled fields with regexes and stands in
//! through [`FallbackExtractor`] when the model endpoint is unavailable.

pub mod document;
pub mod fallback;
pub mod openai;
pub mod pattern;
pub mod prompt;

pub use document::{document_text, pdftotext_available, DocumentKind, DocumentText};
pub use fallback::{build_extractor, extractor_from_env, FallbackExtractor};
pub use openai::{OpenAIConfig, OpenAiExtractor};
pub use pattern::PatternExtractor;
