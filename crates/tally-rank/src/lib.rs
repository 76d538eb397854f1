//! # tally-rank
//!
//! Candidate ranking for the tally invoice pipeline.
//!
//! Scores discovered attachments against a [`SearchIntent`] and orders them
//! by confidence. Pure functions only: no I/O, no clock reads.
//!
//! Signals and weights:
//!
//! | Signal | Weight | Applies when |
//! |--------|--------|--------------|
//! | sender | 1.0 | intent has `sender_email` |
//! | subject | 1.0 | intent has `subject_contains` |
//! | filename | 1.0 | always (hint similarity, or invoice keywords without a hint) |
//! | content | 0.5 | always (content type and size plausibility) |
//!
//! The score is the weighted sum divided by the sum of applicable weights,
//! rounded to four decimals.
//!
//! [`SearchIntent`]: tally_core::SearchIntent

pub mod ranker;
pub mod signals;

pub use ranker::{
    above_threshold, rank, rank_with_weights, recommend, score, RankerWeights, Recommendation,
};
