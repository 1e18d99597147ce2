//! Parsing of `207 Multi-Status` bodies.
//!
//! Elements are matched by local name only, so `<D:href>`, `<d:href>` and
//! `<href xmlns="DAV:">` all read the same. Text is gathered from every text
//! node below an element, which also covers values wrapped in CDATA.

use calsync_core::remote::{DavError, DavResult};
use roxmltree::{Document, Node};

/// One `<response>` with the properties we care about.
///
/// Only properties from a propstat with a 2xx status (or none) are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavResponse {
    pub href: String,
    /// Status given directly on the response, as sync-collection does for removed members
    pub status: Option<u16>,
    pub etag: Option<String>,
    pub calendar_data: Option<String>,
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub ctag: Option<String>,
    pub sync_token: Option<String>,
    pub is_calendar: bool,
    pub components: Vec<String>,
    pub principal: Option<String>,
    pub calendar_homes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multistatus {
    pub responses: Vec<DavResponse>,
    /// Top-level `<sync-token>` of a sync-collection answer
    pub sync_token: Option<String>,
}

impl Multistatus {
    /// Response for `href`, comparing paths without trailing slashes.
    pub fn find(&self, href: &str) -> Option<&DavResponse> {
        let wanted = href.trim_end_matches('/');
        self.responses
            .iter()
            .find(|r| r.href.trim_end_matches('/') == wanted)
    }
}

pub fn parse(body: &str) -> DavResult<Multistatus> {
    let body = body.trim_start_matches('\u{feff}').trim_start();
    let doc = Document::parse(body).map_err(|e| DavError::Malformed(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "multistatus" {
        return Err(DavError::Malformed(format!(
            "expected multistatus, got <{}>",
            root.tag_name().name()
        )));
    }

    let responses = children(root, "response").filter_map(parse_response).collect();
    let sync_token = children(root, "sync-token").next().and_then(text);
    Ok(Multistatus {
        responses,
        sync_token,
    })
}

fn parse_response(node: Node) -> Option<DavResponse> {
    let href = children(node, "href").next().and_then(text)?;
    let mut response = DavResponse {
        href,
        status: children(node, "status").next().and_then(status_code),
        ..Default::default()
    };

    for propstat in children(node, "propstat") {
        let ok = children(propstat, "status")
            .next()
            .and_then(status_code)
            .is_none_or(|code| (200..300).contains(&code));
        if !ok {
            continue;
        }
        for prop in children(propstat, "prop").flat_map(|p| p.children().filter(Node::is_element)) {
            read_property(&mut response, prop);
        }
    }
    Some(response)
}

fn read_property(response: &mut DavResponse, prop: Node) {
    match prop.tag_name().name() {
        "getetag" => response.etag = text(prop),
        "calendar-data" => response.calendar_data = raw_text(prop),
        "displayname" => response.display_name = text(prop),
        "calendar-color" => response.color = text(prop),
        "getctag" => response.ctag = text(prop),
        "sync-token" => response.sync_token = text(prop),
        "resourcetype" => {
            response.is_calendar = prop
                .children()
                .any(|n| n.is_element() && n.tag_name().name() == "calendar");
        }
        "supported-calendar-component-set" => {
            response.components = children(prop, "comp")
                .filter_map(|comp| comp.attribute("name"))
                .map(|name| name.to_ascii_uppercase())
                .collect();
        }
        "current-user-principal" => {
            response.principal = children(prop, "href").next().and_then(text);
        }
        "calendar-home-set" => {
            response.calendar_homes = children(prop, "href").filter_map(text).collect();
        }
        _ => {}
    }
}

fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

/// Concatenated text below `node`, untouched.
fn raw_text(node: Node) -> Option<String> {
    let text: String = node
        .descendants()
        .filter(Node::is_text)
        .filter_map(|n| n.text())
        .collect();
    if text.trim().is_empty() { None } else { Some(text) }
}

fn text(node: Node) -> Option<String> {
    raw_text(node).map(|t| t.trim().to_string())
}

/// `HTTP/1.1 404 Not Found` -> 404
fn status_code(node: Node) -> Option<u16> {
    text(node)?.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parses_any_namespace_prefix() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:response>
    <D:href>/dav/home/a.ics</D:href>
    <D:propstat>
      <D:prop><D:getetag>"1"</D:getetag></D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <response xmlns="DAV:">
    <href>/dav/home/b.ics</href>
    <propstat>
      <prop><getetag>"2"</getetag></prop>
      <status>HTTP/1.1 200 OK</status>
    </propstat>
  </response>
</D:multistatus>"#;

        let ms = parse(body).unwrap();
        let tags: Vec<_> = ms
            .responses
            .iter()
            .map(|r| (r.href.as_str(), r.etag.as_deref()))
            .collect();
        assert_eq!(
            tags,
            vec![
                ("/dav/home/a.ics", Some("\"1\"")),
                ("/dav/home/b.ics", Some("\"2\""))
            ]
        );
    }

    #[test]
    fn test_calendar_data_in_cdata() {
        let body = "<d:multistatus xmlns:d=\"DAV:\" xmlns:cal=\"urn:ietf:params:xml:ns:caldav\">\
<d:response><d:href>/c/x.ics</d:href><d:propstat><d:prop>\
<cal:calendar-data><![CDATA[BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n]]></cal:calendar-data>\
</d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response></d:multistatus>";

        let ms = parse(body).unwrap();
        let data = ms.responses[0].calendar_data.clone().unwrap().replace('\r', "");
        assert_eq!(data, "BEGIN:VCALENDAR\nEND:VCALENDAR\n");
    }

    #[test]
    fn test_ignores_failed_propstat() {
        let body = r#"<d:multistatus xmlns:d="DAV:" xmlns:cs="http://calendarserver.org/ns/">
  <d:response>
    <d:href>/c/</d:href>
    <d:propstat>
      <d:prop><d:displayname>Home</d:displayname></d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
    <d:propstat>
      <d:prop><cs:getctag>stale</cs:getctag></d:prop>
      <d:status>HTTP/1.1 404 Not Found</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

        let ms = parse(body).unwrap();
        assert_eq!(ms.responses[0].display_name.as_deref(), Some("Home"));
        assert_eq!(ms.responses[0].ctag, None);
    }

    #[test]
    fn test_sync_collection_answer() {
        let body = r#"<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/c/gone.ics</d:href>
    <d:status>HTTP/1.1 404 Not Found</d:status>
  </d:response>
  <d:sync-token>http://example.com/sync/7</d:sync-token>
</d:multistatus>"#;

        let ms = parse(body).unwrap();
        assert_eq!(ms.responses[0].status, Some(404));
        assert_eq!(ms.sync_token.as_deref(), Some("http://example.com/sync/7"));
    }

    #[test]
    fn test_calendar_properties() {
        let body = r#"<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:ic="http://apple.com/ns/ical/">
  <d:response>
    <d:href>/c/home/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/><c:calendar/></d:resourcetype>
        <c:supported-calendar-component-set><c:comp name="VEVENT"/><c:comp name="vtodo"/></c:supported-calendar-component-set>
        <ic:calendar-color>#FF0000</ic:calendar-color>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

        let ms = parse(body).unwrap();
        let home = ms.find("/c/home").unwrap();
        assert!(home.is_calendar);
        assert_eq!(home.components, vec!["VEVENT".to_string(), "VTODO".to_string()]);
        assert_eq!(home.color.as_deref(), Some("#FF0000"));
    }

    #[test]
    fn test_rejects_non_multistatus() {
        assert!(matches!(parse("<html/>"), Err(DavError::Malformed(_))));
        assert!(matches!(parse("not xml"), Err(DavError::Malformed(_))));
    }
}
