//! Recurrence rules and their expansion into instance spans.

mod expand;
mod rule;

pub use expand::{InstanceSpan, expand};
pub use rule::{Frequency, RecurrenceRule, RuleEnd, UntilValue, WeekdayNum};
