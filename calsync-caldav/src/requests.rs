//! XML bodies of the PROPFIND and REPORT requests.

const XML_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

pub fn current_user_principal() -> String {
    format!(
        r#"{XML_HEADER}
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:current-user-principal/>
  </d:prop>
</d:propfind>"#
    )
}

pub fn calendar_home_set() -> String {
    format!(
        r#"{XML_HEADER}
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <c:calendar-home-set/>
  </d:prop>
</d:propfind>"#
    )
}

/// Everything needed to list the calendars under a home collection.
pub fn calendar_list() -> String {
    format!(
        r#"{XML_HEADER}
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/" xmlns:ic="http://apple.com/ns/ical/">
  <d:prop>
    <d:resourcetype/>
    <d:displayname/>
    <cs:getctag/>
    <d:sync-token/>
    <c:supported-calendar-component-set/>
    <ic:calendar-color/>
  </d:prop>
</d:propfind>"#
    )
}

pub fn getctag() -> String {
    format!(
        r#"{XML_HEADER}
<d:propfind xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/">
  <d:prop>
    <cs:getctag/>
  </d:prop>
</d:propfind>"#
    )
}

pub fn sync_token() -> String {
    format!(
        r#"{XML_HEADER}
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:sync-token/>
  </d:prop>
</d:propfind>"#
    )
}

pub fn getetag() -> String {
    format!(
        r#"{XML_HEADER}
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:getetag/>
  </d:prop>
</d:propfind>"#
    )
}

pub fn sync_collection(token: &str) -> String {
    format!(
        r#"{XML_HEADER}
<d:sync-collection xmlns:d="DAV:">
  <d:sync-token>{}</d:sync-token>
  <d:sync-level>1</d:sync-level>
  <d:prop>
    <d:getetag/>
  </d:prop>
</d:sync-collection>"#,
        escape(token)
    )
}

/// calendar-query listing etags of events overlapping `start..end`.
///
/// `start` and `end` are already formatted as `YYYYMMDDTHHMMSSZ`.
pub fn calendar_query(start: &str, end: &str) -> String {
    format!(
        r#"{XML_HEADER}
<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
  </d:prop>
  <c:filter>
    <c:comp-filter name="VCALENDAR">
      <c:comp-filter name="VEVENT">
        <c:time-range start="{start}" end="{end}"/>
      </c:comp-filter>
    </c:comp-filter>
  </c:filter>
</c:calendar-query>"#
    )
}

pub fn calendar_multiget(hrefs: &[String]) -> String {
    let hrefs: String = hrefs
        .iter()
        .map(|href| format!("  <d:href>{}</d:href>\n", escape(href)))
        .collect();
    format!(
        r#"{XML_HEADER}
<c:calendar-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
  <d:prop>
    <d:getetag/>
    <c:calendar-data/>
  </d:prop>
{hrefs}</c:calendar-multiget>"#
    )
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
