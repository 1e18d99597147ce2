//! CalDavClient against a mock HTTP server.

use std::time::Duration;

use calsync_caldav::{CalDavClient, Quirks};
use calsync_core::config::AccountConfig;
use calsync_core::date_range::DateRange;
use calsync_core::{CalendarRemote, DavError};
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ICS: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:a\r\nDTSTART:20250101T100000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

fn client(server: &MockServer, vendor: Option<&str>) -> CalDavClient {
    let account = AccountConfig {
        name: "test".into(),
        url: format!("{}/dav/", server.uri()),
        username: "alice".into(),
        password_env: "UNUSED".into(),
        vendor: vendor.map(str::to_string),
    };
    CalDavClient::new(&account, "secret".into(), Duration::from_secs(5)).unwrap()
}

fn multistatus(inner: &str) -> ResponseTemplate {
    ResponseTemplate::new(207).set_body_string(format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/">{inner}</d:multistatus>"#
    ))
}

fn ok_prop(href: &str, props: &str) -> String {
    format!(
        "<d:response><d:href>{href}</d:href><d:propstat><d:prop>{props}</d:prop>\
<d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>"
    )
}

#[tokio::test]
async fn test_discovery_walks_principal_home_and_calendars() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/"))
        .and(body_string_contains("current-user-principal"))
        .respond_with(multistatus(&ok_prop(
            "/dav/",
            "<d:current-user-principal><d:href>/dav/principals/alice/</d:href></d:current-user-principal>",
        )))
        .mount(&server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/principals/alice/"))
        .and(body_string_contains("calendar-home-set"))
        .respond_with(multistatus(&ok_prop(
            "/dav/principals/alice/",
            "<c:calendar-home-set><d:href>/dav/calendars/alice/</d:href></c:calendar-home-set>",
        )))
        .mount(&server)
        .await;
    let listing = [
        ok_prop(
            "/dav/calendars/alice/",
            "<d:resourcetype><d:collection/></d:resourcetype>",
        ),
        ok_prop(
            "/dav/calendars/alice/home/",
            "<d:resourcetype><d:collection/><c:calendar/></d:resourcetype>\
<d:displayname>Home</d:displayname><cs:getctag>c1</cs:getctag>\
<c:supported-calendar-component-set><c:comp name=\"VEVENT\"/></c:supported-calendar-component-set>",
        ),
        ok_prop(
            "/dav/calendars/alice/tasks/",
            "<d:resourcetype><d:collection/><c:calendar/></d:resourcetype>\
<c:supported-calendar-component-set><c:comp name=\"VTODO\"/></c:supported-calendar-component-set>",
        ),
        ok_prop(
            "/dav/calendars/alice/work/",
            "<d:resourcetype><d:collection/><c:calendar/></d:resourcetype>",
        ),
    ]
    .concat();
    Mock::given(method("PROPFIND"))
        .and(path("/dav/calendars/alice/"))
        .and(header("Depth", "1"))
        .respond_with(multistatus(&listing))
        .mount(&server)
        .await;

    let client = client(&server, None);
    assert_eq!(client.quirks(), Quirks::Generic);

    let principal = client.discover_principal().await.unwrap();
    assert_eq!(principal, "/dav/principals/alice/");
    let homes = client.discover_calendar_homes(&principal).await.unwrap();
    assert_eq!(homes, vec!["/dav/calendars/alice/".to_string()]);

    let calendars = client.list_calendars(&homes[0]).await.unwrap();
    let names: Vec<_> = calendars
        .iter()
        .map(|c| (c.href.as_str(), c.name.as_str(), c.ctag.as_deref()))
        .collect();
    assert_eq!(
        names,
        vec![
            ("/dav/calendars/alice/home/", "Home", Some("c1")),
            ("/dav/calendars/alice/work/", "work", None),
        ]
    );
}

#[tokio::test]
async fn test_discovery_falls_back_to_well_known() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/.well-known/caldav"))
        .respond_with(multistatus(&ok_prop(
            "/.well-known/caldav",
            "<d:current-user-principal><d:href>/p/alice/</d:href></d:current-user-principal>",
        )))
        .mount(&server)
        .await;

    let principal = client(&server, None).discover_principal().await.unwrap();
    assert_eq!(principal, "/p/alice/");
}

#[tokio::test]
async fn test_sync_collection_reports_changes_and_deletions() {
    let server = MockServer::start().await;
    let body = [
        ok_prop("/dav/cal/", "<d:getetag>\"col\"</d:getetag>"),
        ok_prop("/dav/cal/a.ics", "<d:getetag>\"2\"</d:getetag>"),
        "<d:response><d:href>/dav/cal/b.ics</d:href><d:status>HTTP/1.1 404 Not Found</d:status></d:response>"
            .to_string(),
        "<d:sync-token>http://example.com/sync/9</d:sync-token>".to_string(),
    ]
    .concat();
    Mock::given(method("REPORT"))
        .and(path("/dav/cal/"))
        .and(body_string_contains("<d:sync-token>http://example.com/sync/8</d:sync-token>"))
        .respond_with(multistatus(&body))
        .mount(&server)
        .await;

    let report = client(&server, None)
        .sync_collection("/dav/cal/", "http://example.com/sync/8")
        .await
        .unwrap();
    assert_eq!(report.changed.len(), 1);
    assert_eq!(report.changed[0].href, "/dav/cal/a.ics");
    assert_eq!(report.changed[0].etag, "\"2\"");
    assert_eq!(report.deleted, vec!["/dav/cal/b.ics".to_string()]);
    assert_eq!(report.new_token.as_deref(), Some("http://example.com/sync/9"));
}

#[tokio::test]
async fn test_invalid_sync_token_means_resync() {
    let server = MockServer::start().await;
    Mock::given(method("REPORT"))
        .and(path("/dav/cal/"))
        .respond_with(ResponseTemplate::new(403).set_body_string(
            r#"<d:error xmlns:d="DAV:"><d:valid-sync-token/></d:error>"#,
        ))
        .mount(&server)
        .await;

    let result = client(&server, None)
        .sync_collection("/dav/cal/", "old")
        .await;
    assert_eq!(result, Err(DavError::TokenExpired));
}

#[tokio::test]
async fn test_list_etags_fills_in_missing_tags() {
    let server = MockServer::start().await;
    let body = [
        ok_prop("/dav/cal/a.ics", "<d:getetag>\"1\"</d:getetag>"),
        ok_prop("/dav/cal/b.ics", ""),
    ]
    .concat();
    Mock::given(method("REPORT"))
        .and(path("/dav/cal/"))
        .and(body_string_contains("time-range start=\"20250101T000000Z\""))
        .respond_with(multistatus(&body))
        .mount(&server)
        .await;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/cal/b.ics"))
        .and(header("Depth", "0"))
        .respond_with(multistatus(&ok_prop(
            "/dav/cal/b.ics",
            "<d:getetag>\"7\"</d:getetag>",
        )))
        .expect(1)
        .mount(&server)
        .await;

    let range = DateRange::new(
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    );
    let tags = client(&server, None)
        .list_etags("/dav/cal/", &range)
        .await
        .unwrap();
    let tags: Vec<_> = tags.iter().map(|t| (t.href.as_str(), t.etag.as_str())).collect();
    assert_eq!(tags, vec![("/dav/cal/a.ics", "\"1\""), ("/dav/cal/b.ics", "\"7\"")]);
}

#[tokio::test]
async fn test_empty_multiget_falls_back_to_get() {
    let server = MockServer::start().await;
    Mock::given(method("REPORT"))
        .and(path("/dav/cal/"))
        .and(body_string_contains("calendar-multiget"))
        .respond_with(multistatus(""))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dav/cal/a.ics"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"5\"")
                .set_body_string(ICS),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dav/cal/b.ics"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let resources = client(&server, None)
        .fetch_resources(
            "/dav/cal/",
            &["/dav/cal/a.ics".to_string(), "/dav/cal/b.ics".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].href, "/dav/cal/a.ics");
    assert_eq!(resources[0].etag, "\"5\"");
    assert_eq!(resources[0].data, ICS);
}

#[tokio::test]
async fn test_multiget_returns_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("REPORT"))
        .and(path("/dav/cal/"))
        .respond_with(multistatus(&ok_prop(
            &format!("{}/dav/cal/a.ics", server.uri()),
            "<d:getetag>\"3\"</d:getetag><c:calendar-data>BEGIN:VCALENDAR\nEND:VCALENDAR\n</c:calendar-data>",
        )))
        .mount(&server)
        .await;

    let resources = client(&server, None)
        .fetch_resources("/dav/cal/", &["/dav/cal/a.ics".to_string()])
        .await
        .unwrap();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].href, "/dav/cal/a.ics");
    assert_eq!(resources[0].etag, "\"3\"");
}

#[tokio::test]
async fn test_conditional_writes() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/dav/cal/new.ics"))
        .and(header("If-None-Match", "*"))
        .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"1\""))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/dav/cal/taken.ics"))
        .and(header("If-None-Match", "*"))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/dav/cal/stale.ics"))
        .and(header("If-Match", "\"old\""))
        .respond_with(ResponseTemplate::new(412))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/dav/cal/gone.ics"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/dav/cal/busy.ics"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client(&server, None);
    assert_eq!(
        client.create_resource("/dav/cal/new.ics", ICS).await,
        Ok(Some("\"1\"".to_string()))
    );
    assert_eq!(
        client.create_resource("/dav/cal/taken.ics", ICS).await,
        Err(DavError::AlreadyExists("/dav/cal/taken.ics".into()))
    );
    assert_eq!(
        client.update_resource("/dav/cal/stale.ics", ICS, "\"old\"").await,
        Err(DavError::Conflict("/dav/cal/stale.ics".into()))
    );
    assert_eq!(
        client.delete_resource("/dav/cal/gone.ics", Some("\"1\"")).await,
        Ok(())
    );
    assert!(matches!(
        client.delete_resource("/dav/cal/busy.ics", None).await,
        Err(DavError::Transient(_))
    ));
}

#[tokio::test]
async fn test_vendor_without_ctag_skips_the_request() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let client = client(&server, Some("yahoo"));
    assert_eq!(client.quirks(), Quirks::Yahoo);
    assert_eq!(client.get_ctag("/dav/cal/").await, Ok(None));
    assert_eq!(client.get_sync_token("/dav/cal/").await, Ok(None));
}
