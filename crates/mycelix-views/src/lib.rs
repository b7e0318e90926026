mod importance;
mod search;
mod thread;

pub use importance::{
    filter_important, score, score_at, should_auto_label, sort_by_importance, ImportanceLevel,
    AUTO_LABEL_THRESHOLD, URGENT_KEYWORDS,
};
pub use search::{
    filter, format_query, matches, parse, suggestions, LabelSource, OperatorKind, ParsedQuery,
    SearchOperator, Suggestion,
};
pub use thread::{
    format_participants, group, is_same_thread, normalize_subject, thread_importance, Thread,
};
