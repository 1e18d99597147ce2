use anyhow::Result;
use calsync_core::store::CalendarStore;
use owo_colors::OwoColorize;

use crate::app::App;
use crate::render::{Render, render_pending};

pub async fn run(app: &App) -> Result<()> {
    let mut any = false;

    for cal in app.calendars(None).await? {
        let ops = app.store.pending_operations(&cal.id).await?;
        if ops.is_empty() {
            continue;
        }
        if any {
            println!();
        }
        any = true;

        println!("{}", cal.render());
        for op in &ops {
            let summary = match app.store.event(op.event_id).await? {
                Some(event) => event.data.summary,
                None => op.event_id.to_string(),
            };
            println!("{}", render_pending(op, &summary));
        }
    }

    if !any {
        println!("{}", "Nothing waiting to be uploaded".dimmed());
    }
    Ok(())
}
