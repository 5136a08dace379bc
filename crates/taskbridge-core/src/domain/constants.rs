//! Tunable constants for matching and reconciliation.

/// Weight of title similarity in the pair score.
pub const TITLE_WEIGHT: f64 = 0.65;

/// Weight of the due-date component in the pair score.
pub const DATE_WEIGHT: f64 = 0.25;

/// Weight of the status component in the pair score.
pub const STATUS_WEIGHT: f64 = 0.10;

/// Status component when the two statuses disagree.
pub const STATUS_MISMATCH_COMPONENT: f64 = 0.7;

/// Date component when neither side carries a due date.
pub const NO_DATES_COMPONENT: f64 = 0.5;

/// Default minimum score gate for forming a link.
pub const DEFAULT_MIN_SCORE: f64 = 0.75;

/// Default due-date tolerance, in days.
pub const DEFAULT_DAYS_TOLERANCE: i64 = 1;

/// Minimum title similarity for grouping near-identical tasks in the
/// duplicate detector.
pub const DUPLICATE_TITLE_SIMILARITY: f64 = 0.75;

/// Tokens dropped before title comparison.
pub const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "at", "for", "in", "of", "on", "or", "the", "to", "with",
];
