//! ICS file generation and parsing.
//!
//! This module handles reading and writing calendar object resources
//! according to RFC 5545, including recurring series with exceptions.

mod generate;
mod group;
mod parse;
pub mod timezone;

pub use generate::generate_ics;
pub use group::{ComponentRole, EventGroup, ParseIssue, group_components};
pub use parse::{ParsedCalendar, parse_calendar};

use icalendar::parser::Component;

/// Components of a parsed document, looking through a wrapping VCALENDAR.
pub(crate) fn document_components<'b, 'a>(components: &'b [Component<'a>]) -> &'b [Component<'a>] {
    match components.iter().find(|c| c.name == "VCALENDAR") {
        Some(vcalendar) => &vcalendar.components,
        None => components,
    }
}
