//! TUI rendering traits for calsync types.

use calsync_core::pending::{OperationState, PendingOperation};
use calsync_core::sync::ChangeCounts;
use calsync_core::{Calendar, Event, Occurrence, SyncNotice, SyncReport};
use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;

/// Extension trait for TUI rendering with colors.
pub trait Render {
    fn render(&self) -> String;
}

impl Render for Calendar {
    fn render(&self) -> String {
        format!("📅 {}", self.name)
    }
}

impl Render for SyncNotice {
    fn render(&self) -> String {
        match self {
            SyncNotice::OperationFlagged { .. } => format!("   {} {}", "!".red(), self.to_string().red()),
            _ => format!("   {} {}", "!".yellow(), self.to_string().yellow()),
        }
    }
}

pub trait SyncReportRender {
    fn render(&self, verbose: bool) -> String;
}

impl SyncReportRender for SyncReport {
    fn render(&self, verbose: bool) -> String {
        let mut lines = Vec::new();

        if !self.has_changes() {
            let note = if self.up_to_date {
                "   Up to date"
            } else {
                "   No changes"
            };
            lines.push(note.dimmed().to_string());
        }
        if self.pulled.total() > 0 {
            lines.push(format!("   {} {}", "↓".green(), render_counts(&self.pulled)));
        }
        if self.pushed.total() > 0 {
            lines.push(format!("   {} {}", "↑".cyan(), render_counts(&self.pushed)));
        }
        if verbose && self.full_resync {
            lines.push("   (full resync)".dimmed().to_string());
        }
        lines.extend(self.notices.iter().map(Render::render));

        lines.join("\n")
    }
}

fn render_counts(counts: &ChangeCounts) -> String {
    let mut parts = Vec::new();
    if counts.created > 0 {
        parts.push(format!("{} created", counts.created).green().to_string());
    }
    if counts.updated > 0 {
        parts.push(format!("{} updated", counts.updated).yellow().to_string());
    }
    if counts.deleted > 0 {
        parts.push(format!("{} deleted", counts.deleted).red().to_string());
    }
    parts.join(", ")
}

/// One agenda line: time span, title and calendar.
pub fn render_occurrence(occurrence: &Occurrence, event: &Event, calendar: &str) -> String {
    let time = if event.data.all_day {
        "all day".to_string()
    } else {
        format!(
            "{}-{}",
            local_time(occurrence.start, event),
            local_time(occurrence.end, event)
        )
    };

    let line = if occurrence.cancelled {
        format!("{} {}", event.data.summary.strikethrough(), "(cancelled)".dimmed())
    } else {
        event.data.summary.clone()
    };
    format!("   {} {} {}", format!("{time:<11}").dimmed(), line, calendar.dimmed())
}

/// Wall-clock time in the event's own zone.
fn local_time(instant: DateTime<Utc>, event: &Event) -> String {
    match event.data.zone() {
        Some(tz) => instant.with_timezone(&tz).format("%H:%M").to_string(),
        None => instant.format("%H:%M").to_string(),
    }
}

/// One queue entry with the title of the event it uploads.
pub fn render_pending(op: &PendingOperation, summary: &str) -> String {
    let label = format!("{:<8}", op.kind.label());
    let kind = match op.state {
        OperationState::Queued => label.yellow().to_string(),
        OperationState::NeedsAttention => label.red().to_string(),
    };
    let mut line = format!("   {kind} {summary}");

    if op.retry_count > 0 {
        let noun = if op.retry_count == 1 { "retry" } else { "retries" };
        let retries = format!("({} {})", op.retry_count, noun);
        line.push_str(&format!(" {}", retries.dimmed()));
    }
    if let Some(at) = op.next_attempt_at
        && op.state == OperationState::Queued
    {
        line.push_str(&format!(" {}", format!("next try {}", at.format("%Y-%m-%d %H:%M")).dimmed()));
    }
    if let Some(error) = &op.last_error {
        line.push_str(&format!("\n      {}", error.red()));
    }
    line
}
