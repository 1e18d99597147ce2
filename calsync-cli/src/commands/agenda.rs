use std::collections::HashMap;

use anyhow::Result;
use calsync_core::occurrence::day_number;
use calsync_core::store::CalendarStore;
use calsync_core::{DateRange, Event, EventId};
use chrono::{Duration, NaiveDate, Utc};
use owo_colors::OwoColorize;

use crate::app::App;
use crate::render::render_occurrence;
use crate::utils::tui::pluralize;

/// Days shown when only `--from` (or nothing) is given.
const DEFAULT_DAYS: i64 = 7;

pub async fn run(app: &App, from: Option<&str>, to: Option<&str>, calendar: Option<&str>) -> Result<()> {
    let from = from
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().date_naive().format("%Y-%m-%d").to_string());
    let to = match to {
        Some(to) => to.to_string(),
        None => {
            let first = NaiveDate::parse_from_str(&from, "%Y-%m-%d")
                .map_err(|_| anyhow::anyhow!("Invalid date format '{}'. Expected YYYY-MM-DD", from))?;
            (first + Duration::days(DEFAULT_DAYS - 1)).format("%Y-%m-%d").to_string()
        }
    };
    let range = DateRange::from_dates(&from, &to).map_err(|e| anyhow::anyhow!(e))?;

    let calendars = app.calendars(calendar).await?;
    let names: HashMap<_, _> = calendars.iter().map(|c| (c.id.clone(), c.name.clone())).collect();
    let first_day = day_number(range.from.date_naive());
    let last_day = day_number((range.to - Duration::seconds(1)).date_naive());

    let mut occurrences = Vec::new();
    for cal in &calendars {
        occurrences.extend(
            app.store
                .occurrences_in_days(Some(&cal.id), first_day, last_day)
                .await?,
        );
    }
    occurrences.sort_by_key(|o| (o.start_day.max(first_day), o.start, o.end));

    let mut events: HashMap<EventId, Event> = HashMap::new();
    let mut current_day = None;
    for occurrence in &occurrences {
        if !events.contains_key(&occurrence.effective_event_id)
            && let Some(event) = app.store.event(occurrence.effective_event_id).await?
        {
            events.insert(occurrence.effective_event_id, event);
        }
        let Some(event) = events.get(&occurrence.effective_event_id) else {
            continue;
        };

        // Multi-day occurrences that started earlier are listed under the first day shown
        let day_code = occurrence.start_day.max(first_day);
        if current_day != Some(day_code) {
            if current_day.is_some() {
                println!();
            }
            if let Some(day) = NaiveDate::from_num_days_from_ce_opt(day_code) {
                println!("{}", day.format("%a %Y-%m-%d").bold());
            }
            current_day = Some(day_code);
        }

        let calendar_name = names
            .get(&event.calendar_id)
            .map(String::as_str)
            .unwrap_or_default();
        println!("{}", render_occurrence(occurrence, event, calendar_name));
    }

    if occurrences.is_empty() {
        println!("{}", "No events".dimmed());
    } else {
        println!(
            "\n{}",
            format!("{} {}", occurrences.len(), pluralize("occurrence", occurrences.len())).dimmed()
        );
    }
    Ok(())
}
