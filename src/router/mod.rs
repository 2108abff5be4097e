pub mod matcher;
pub mod process;
pub mod rules;
pub mod shunt;
pub mod trie;

pub use matcher::{RuleMatcher, SharedMatcher};
pub use process::{ProcessDetector, ProcessDumper};
pub use rules::{Mode, Pattern, PatternKind, RuleEntry};
pub use shunt::{BypassEngine, Decision, MatchKind};
