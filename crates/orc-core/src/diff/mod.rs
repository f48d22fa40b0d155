//! DiffValidator (spec §4.3): structural, syntactic, and typecheck
//! validation of candidate diffs.

pub mod parser;
pub mod sanitizer;
pub mod validator;

pub use parser::{DiffHunk, DiffParseError, FileDiff};
pub use sanitizer::SanitizerRewrite;
pub use validator::ValidationResult;
