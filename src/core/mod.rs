mod finding;
mod outcome;
mod severity;
mod target;

pub use finding::{ClassifiedFinding, Recommendation};
pub use outcome::{Detail, FailureKind, Outcome, OutcomeKind, now_rfc3339};
pub use severity::{Severity, SeveritySummary};
pub use target::Target;
