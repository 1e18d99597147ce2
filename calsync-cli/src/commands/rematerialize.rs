use anyhow::Result;
use owo_colors::OwoColorize;

use crate::app::App;
use crate::render::Render;

pub async fn run(app: &App, calendar: Option<&str>) -> Result<()> {
    let calendars = app.calendars(calendar).await?;
    for cal in &calendars {
        let Some(account) = app.config.account(&cal.account) else {
            println!("{}\n   {}", cal.render(), "Account no longer configured".dimmed());
            continue;
        };
        let rows = app.offline_engine(account)?.rematerialize(&cal.id).await?;
        println!("{} {}", cal.render(), format!("{rows} occurrences").dimmed());
    }
    Ok(())
}
