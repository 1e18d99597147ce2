use anyhow::Result;
use owo_colors::OwoColorize;

use crate::app::App;
use crate::render::Render;
use crate::utils::tui;

pub async fn run(app: &App, account: Option<&str>) -> Result<()> {
    let accounts = app.accounts(account)?;

    for (i, account) in accounts.iter().enumerate() {
        let engine = app.engine(account)?;
        let spinner = tui::create_spinner(format!("🔎 {}", account.name));
        let result = engine.discover().await;
        spinner.finish_and_clear();

        println!("{} {}", account.name.bold(), account.url.dimmed());
        match result {
            Ok(calendars) if calendars.is_empty() => {
                println!("   {}", "No event calendars".dimmed())
            }
            Ok(calendars) => {
                for cal in calendars {
                    let href = cal.href.dimmed().to_string();
                    println!("   {} {}", cal.render(), href);
                }
            }
            Err(e) => println!("   {}", e.to_string().red()),
        }

        if i < accounts.len() - 1 {
            println!();
        }
    }

    Ok(())
}
