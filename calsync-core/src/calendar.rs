//! Locally known calendar collections.

use serde::{Deserialize, Serialize};

use crate::event::CalendarId;
use crate::remote::RemoteCalendar;

/// A calendar collection mirrored from an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub id: CalendarId,
    /// Name of the account this calendar belongs to
    pub account: String,
    /// Collection URL path on the server, always ending in `/`
    pub href: String,
    pub name: String,
    pub color: Option<String>,
    pub enabled: bool,
}

impl Calendar {
    /// Build the local row for a discovered collection.
    ///
    /// The id is derived from account and href so rediscovery maps onto the same row.
    pub fn from_remote(account: &str, remote: &RemoteCalendar) -> Self {
        let href = if remote.href.ends_with('/') {
            remote.href.clone()
        } else {
            format!("{}/", remote.href)
        };
        Calendar {
            id: CalendarId::new(format!("{}:{}", account, href)),
            account: account.to_string(),
            href,
            name: remote.name.clone(),
            color: remote.color.clone(),
            enabled: true,
        }
    }

    /// URL of the resource holding the event with `uid`.
    pub fn event_href(&self, uid: &str) -> String {
        format!("{}{}.ics", self.href, sanitize_uid(uid))
    }
}

/// Make a uid safe to use as a path segment.
fn sanitize_uid(uid: &str) -> String {
    uid.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '@' => c,
            _ => '_',
        })
        .collect()
}
