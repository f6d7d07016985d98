pub mod classifier;
pub mod matcher;
pub mod util;

pub use classifier::{Classifier, ClassifierPolicy, EmbeddingHit, PayeeEvidence, Suggestion};
pub use matcher::{MatchResult, PatternMatcher};
pub use util::{best_fuzzy_match, levenshtein_distance, name_similarity};
