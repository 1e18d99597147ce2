use anyhow::Result;
use calsync_core::sync::ChangeCounts;
use calsync_core::{Calendar, SyncOutcome};
use owo_colors::OwoColorize;
use tracing::debug;

use crate::app::App;
use crate::render::{Render, SyncReportRender};
use crate::utils::tui;

pub async fn run(
    app: &App,
    account: Option<&str>,
    calendar: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let mut pulled = ChangeCounts::default();
    let mut pushed = ChangeCounts::default();
    let mut failed = 0;
    let mut synced = 0;

    for account in app.accounts(account)? {
        let engine = app.engine(account)?;

        let spinner = tui::create_spinner(format!("🔎 {}", account.name));
        let discovered = engine.discover().await;
        spinner.finish_and_clear();
        let calendars: Vec<Calendar> = match discovered {
            Ok(_) => app
                .calendars(None)
                .await?
                .into_iter()
                .filter(|c| c.account == account.name && c.enabled)
                .filter(|c| calendar.is_none_or(|wanted| c.name == wanted || c.id.as_str() == wanted))
                .collect(),
            Err(e) => {
                println!("🔎 {}\n   {}", account.name, e.to_string().red());
                failed += 1;
                continue;
            }
        };

        debug!(account = %account.name, calendars = calendars.len(), "syncing account");
        synced += calendars.len();
        for cal in &calendars {
            let spinner = tui::create_spinner(cal.render());
            let result = engine.sync_now(&cal.id).await;
            spinner.finish_and_clear();

            println!("{}", cal.render());
            match result {
                Ok(SyncOutcome::Completed(report)) => {
                    println!("{}", report.render(verbose));
                    add(&mut pulled, &report.pulled);
                    add(&mut pushed, &report.pushed);
                }
                Ok(SyncOutcome::AlreadyRunning) => {
                    println!("   {}", "Already syncing".dimmed());
                }
                Err(e) => {
                    println!("   {}", e.to_string().red());
                    failed += 1;
                }
            }
            println!();
        }
    }

    if let Some(wanted) = calendar
        && synced == 0
        && failed == 0
    {
        anyhow::bail!("Calendar '{}' not found", wanted);
    }

    if pulled.total() > 0 {
        println!(
            "Pulled: {} created, {} updated, {} deleted",
            pulled.created, pulled.updated, pulled.deleted
        );
    }
    if pushed.total() > 0 {
        println!(
            "Pushed: {} created, {} updated, {} deleted",
            pushed.created, pushed.updated, pushed.deleted
        );
    }
    if failed > 0 {
        anyhow::bail!("{} sync(s) failed", failed);
    }
    Ok(())
}

fn add(total: &mut ChangeCounts, counts: &ChangeCounts) {
    total.created += counts.created;
    total.updated += counts.updated;
    total.deleted += counts.deleted;
}
