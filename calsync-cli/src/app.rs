use std::sync::Arc;

use anyhow::{Context, Result};
use calsync_caldav::CalDavClient;
use calsync_core::store::CalendarStore;
use calsync_core::{AccountConfig, Calendar, CalsyncConfig, MemoryStore, SyncEngine};

pub type Engine = SyncEngine<CalDavClient, MemoryStore>;

/// Loaded configuration plus the local store shared by every account.
pub struct App {
    pub config: CalsyncConfig,
    pub store: Arc<MemoryStore>,
}

impl App {
    pub fn load() -> Result<Self> {
        let config = CalsyncConfig::load().context("Failed to load configuration")?;
        let state_path = config.state_path();
        let store = MemoryStore::open(&state_path)
            .with_context(|| format!("Failed to open local state at {}", state_path.display()))?;
        Ok(App {
            config,
            store: Arc::new(store),
        })
    }

    /// Configured accounts, optionally narrowed to one by name.
    pub fn accounts(&self, filter: Option<&str>) -> Result<Vec<&AccountConfig>> {
        if self.config.accounts.is_empty() {
            let path = CalsyncConfig::config_path()?;
            anyhow::bail!(
                "No accounts configured.\n\n\
                Add one to {}:\n\n  \
                [[accounts]]\n  \
                name = \"personal\"\n  \
                url = \"https://caldav.example.com/\"\n  \
                username = \"me@example.com\"\n  \
                password_env = \"CALSYNC_PERSONAL_PASSWORD\"",
                path.display()
            );
        }

        match filter {
            Some(name) => match self.config.account(name) {
                Some(account) => Ok(vec![account]),
                None => {
                    let available: Vec<_> =
                        self.config.accounts.iter().map(|a| a.name.as_str()).collect();
                    anyhow::bail!(
                        "Account '{}' not found. Available: {}",
                        name,
                        available.join(", ")
                    );
                }
            },
            None => Ok(self.config.accounts.iter().collect()),
        }
    }

    pub fn engine(&self, account: &AccountConfig) -> Result<Engine> {
        self.build_engine(account, account.password()?)
    }

    /// Engine for work that never reaches the server, so no password is needed.
    pub fn offline_engine(&self, account: &AccountConfig) -> Result<Engine> {
        self.build_engine(account, String::new())
    }

    fn build_engine(&self, account: &AccountConfig, password: String) -> Result<Engine> {
        let client = CalDavClient::new(account, password, self.config.sync.request_timeout)
            .with_context(|| format!("Failed to set up account '{}'", account.name))?;
        Ok(SyncEngine::new(
            account.name.clone(),
            client,
            Arc::clone(&self.store),
            self.config.sync.clone(),
        ))
    }

    /// Locally known calendars, optionally narrowed to one by name or id.
    pub async fn calendars(&self, filter: Option<&str>) -> Result<Vec<Calendar>> {
        let mut calendars = self.store.calendars().await?;
        calendars.sort_by(|a, b| (&a.account, &a.name).cmp(&(&b.account, &b.name)));

        match filter {
            Some(wanted) => {
                let matching: Vec<_> = calendars
                    .iter()
                    .filter(|c| c.name == wanted || c.id.as_str() == wanted)
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    let available: Vec<_> = calendars.iter().map(|c| c.name.as_str()).collect();
                    anyhow::bail!(
                        "Calendar '{}' not found. Available: {}",
                        wanted,
                        available.join(", ")
                    );
                }
                Ok(matching)
            }
            None => Ok(calendars),
        }
    }
}
