//! Fixed conflict policy between operation categories on the same recording.
//!
//! | candidate \ existing | Capture | Transcription | Analysis |
//! |----------------------|---------|---------------|----------|
//! | Capture              | dup     | -             | -        |
//! | Transcription        | busy    | dup           | -        |
//! | Analysis             | busy    | -             | dup      |
//!
//! A capture owns the recording's file while it runs, so nothing that reads
//! the file may run alongside it, and no category runs twice at once on the
//! same recording. Operations on different recordings never conflict.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::operation::Category;

/// Why a candidate operation may not run next to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// A second capture for a recording that is already being captured.
    DuplicateCapture,
    /// Transcription or analysis while the recording is still being captured.
    CaptureInProgress,
    DuplicateTranscription,
    DuplicateAnalysis,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::DuplicateCapture => "capture already in progress for this recording",
            Self::CaptureInProgress => "recording is still being captured",
            Self::DuplicateTranscription => "transcription already in progress for this recording",
            Self::DuplicateAnalysis => "analysis already in progress for this recording",
        };
        f.write_str(text)
    }
}

/// Looks up the conflict table for two categories on the same recording.
///
/// Returns `None` when `candidate` may run while `existing` is in flight.
#[must_use]
pub fn conflict_between(candidate: Category, existing: Category) -> Option<ConflictKind> {
    match (candidate, existing) {
        (Category::Capture, Category::Capture) => Some(ConflictKind::DuplicateCapture),
        (Category::Transcription | Category::Analysis, Category::Capture) => {
            Some(ConflictKind::CaptureInProgress)
        }
        (Category::Transcription, Category::Transcription) => {
            Some(ConflictKind::DuplicateTranscription)
        }
        (Category::Analysis, Category::Analysis) => Some(ConflictKind::DuplicateAnalysis),
        (Category::Capture, Category::Transcription | Category::Analysis)
        | (Category::Transcription, Category::Analysis)
        | (Category::Analysis, Category::Transcription) => None,
    }
}

/// First conflict `candidate` has with any of `existing`, in iteration order.
#[must_use]
pub fn first_conflict<I>(candidate: Category, existing: I) -> Option<(Category, ConflictKind)>
where
    I: IntoIterator<Item = Category>,
{
    existing
        .into_iter()
        .find_map(|other| conflict_between(candidate, other).map(|kind| (other, kind)))
}
