//! Weighted candidate scoring, ordering, and recommendation.

use std::cmp::Ordering;

use tracing::debug;

use tally_core::{AttachmentCandidate, DiscoveredAttachment, SearchIntent};

use crate::signals::{self, CONTENT_MAX};

/// Signal weights. A signal's weight only counts toward the normalizer when
/// the signal applies to the intent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankerWeights {
    pub sender: f64,
    pub subject: f64,
    pub filename: f64,
    pub content: f64,
}

impl Default for RankerWeights {
    fn default() -> Self {
        Self {
            sender: 1.0,
            subject: 1.0,
            filename: 1.0,
            content: 0.5,
        }
    }
}

/// Outcome of picking a single candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Recommendation {
    Recommended(AttachmentCandidate),
    /// Nothing reached the threshold; `best` is the top scorer, if any.
    NoSuitableMatch { best: Option<AttachmentCandidate> },
}

impl Recommendation {
    pub fn candidate(&self) -> Option<&AttachmentCandidate> {
        match self {
            Recommendation::Recommended(c) => Some(c),
            Recommendation::NoSuitableMatch { .. } => None,
        }
    }
}

/// Score and order discovered attachments with the default weights.
pub fn rank(intent: &SearchIntent, discovered: &[DiscoveredAttachment]) -> Vec<AttachmentCandidate> {
    rank_with_weights(intent, discovered, &RankerWeights::default())
}

/// Score and order discovered attachments.
///
/// Order: score descending, then more recent `received_at`, then
/// `attachment_name`, then `message_id`.
pub fn rank_with_weights(
    intent: &SearchIntent,
    discovered: &[DiscoveredAttachment],
    weights: &RankerWeights,
) -> Vec<AttachmentCandidate> {
    let mut candidates: Vec<AttachmentCandidate> = discovered
        .iter()
        .map(|attachment| score(intent, attachment, weights))
        .collect();

    candidates.sort_by(compare_candidates);

    debug!(
        subsystem = "ranking",
        op = "rank",
        discovered = discovered.len(),
        top_score = candidates.first().map(|c| c.confidence_score),
        "Ranked candidates"
    );

    candidates
}

/// Score one attachment against the intent.
pub fn score(
    intent: &SearchIntent,
    attachment: &DiscoveredAttachment,
    weights: &RankerWeights,
) -> AttachmentCandidate {
    let mut total = 0.0;
    let mut applicable = 0.0;
    let mut reasons = Vec::new();

    let mut apply = |weight: f64, m: signals::SignalMatch| {
        total += weight * m.value;
        applicable += weight;
        if m.value > 0.0 {
            reasons.extend(m.reason);
        }
    };

    if let Some(query) = non_empty(&intent.sender_email) {
        apply(weights.sender, signals::sender(query, &attachment.sender_email));
    }
    if let Some(needle) = non_empty(&intent.subject_contains) {
        apply(weights.subject, signals::subject(needle, &attachment.subject));
    }
    let filename = match non_empty(&intent.attachment_name_hint) {
        Some(hint) => signals::filename_hint(hint, &attachment.attachment_name),
        None => signals::filename_keywords(&attachment.attachment_name),
    };
    apply(weights.filename, filename);

    let (content_raw, content_reasons) = signals::content(
        &attachment.content_type,
        &attachment.attachment_name,
        attachment.size_bytes,
    );
    total += weights.content * (content_raw / CONTENT_MAX);
    applicable += weights.content;
    reasons.extend(content_reasons);

    let confidence = if applicable > 0.0 {
        round4(total / applicable)
    } else {
        0.0
    };

    AttachmentCandidate::from_discovered(attachment, confidence, reasons)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn compare_candidates(a: &AttachmentCandidate, b: &AttachmentCandidate) -> Ordering {
    b.confidence_score
        .partial_cmp(&a.confidence_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.received_at.cmp(&a.received_at))
        .then_with(|| a.attachment_name.cmp(&b.attachment_name))
        .then_with(|| a.message_id.cmp(&b.message_id))
}

/// Pick the top candidate if it reaches `threshold`.
///
/// `candidates` must be in ranked order, as returned by [`rank`].
pub fn recommend(candidates: &[AttachmentCandidate], threshold: f64) -> Recommendation {
    match candidates.first() {
        Some(top) if top.confidence_score >= threshold => Recommendation::Recommended(top.clone()),
        best => Recommendation::NoSuitableMatch {
            best: best.cloned(),
        },
    }
}

/// Every candidate at or above `threshold`, in ranked order.
pub fn above_threshold(candidates: &[AttachmentCandidate], threshold: f64) -> Vec<AttachmentCandidate> {
    candidates
        .iter()
        .filter(|c| c.confidence_score >= threshold)
        .cloned()
        .collect()
}
