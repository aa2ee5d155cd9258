//! Source attribution for generated answers.

use std::collections::HashMap;

use crate::models::{RetrievalResult, Source};

/// Maximum number of sources attached to an answer.
pub const MAX_SOURCES: usize = 3;

/// Keep the best segment per document, highest score first, at most
/// [`MAX_SOURCES`]. Ties prefer the lower segment id.
pub fn build_sources(results: &[RetrievalResult]) -> Vec<Source> {
    let mut best: HashMap<&str, &RetrievalResult> = HashMap::new();
    for r in results {
        best.entry(r.document_id.as_str())
            .and_modify(|current| {
                if better(r, current) {
                    *current = r;
                }
            })
            .or_insert(r);
    }

    let mut picked: Vec<&RetrievalResult> = best.into_values().collect();
    picked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.segment_id.cmp(&b.segment_id))
    });
    picked.truncate(MAX_SOURCES);

    picked
        .into_iter()
        .map(|r| Source {
            segment_id: r.segment_id.clone(),
            document_id: r.document_id.clone(),
            document_filename: r.document_filename.clone(),
            score: r.score,
            preview: r.preview.clone(),
        })
        .collect()
}

fn better(candidate: &RetrievalResult, current: &RetrievalResult) -> bool {
    candidate.score > current.score
        || (candidate.score == current.score && candidate.segment_id < current.segment_id)
}
