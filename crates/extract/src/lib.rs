pub mod capability;
pub mod remote;
pub mod rules;
pub mod types;

pub use capability::{CapabilityError, Fallback, MockBackend, TextUnderstanding};
pub use remote::HttpBackend;
pub use rules::{InstitutionTemplate, RuleExtractor};
pub use types::{ExtractedField, ExtractedFields, InstitutionHint};
