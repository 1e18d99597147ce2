//! CalDAV client over reqwest.

use std::time::Duration;

use calsync_core::config::AccountConfig;
use calsync_core::date_range::DateRange;
use calsync_core::remote::{
    CalendarRemote, ChangeReport, DavError, DavResult, RemoteCalendar, Resource, ResourceTag,
};
use parking_lot::RwLock;
use reqwest::header::{
    CONTENT_TYPE, ETAG, HeaderMap, HeaderName, HeaderValue, IF_MATCH, IF_NONE_MATCH,
};
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::multistatus::{self, DavResponse, Multistatus};
use crate::quirks::Quirks;
use crate::requests;

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
const ICS_CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

#[derive(Debug, Clone, Copy)]
enum Depth {
    Zero,
    One,
}

impl Depth {
    fn as_str(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
        }
    }
}

/// What we keep of an HTTP response.
#[derive(Debug)]
struct Reply {
    status: StatusCode,
    /// URL after redirects
    url: Url,
    etag: Option<String>,
    body: String,
}

/// A CalDAV account, reachable over HTTP(S) with basic auth.
#[derive(Debug)]
pub struct CalDavClient {
    http: reqwest::Client,
    /// Scheme and host requests are resolved against. Moves when discovery gets redirected.
    origin: RwLock<Url>,
    start: Url,
    username: String,
    password: String,
    quirks: Quirks,
}

impl CalDavClient {
    /// Client for `account`. The vendor comes from the account config when set,
    /// otherwise it is detected from the URL.
    pub fn new(account: &AccountConfig, password: String, timeout: Duration) -> DavResult<Self> {
        let start = Url::parse(&account.url)
            .map_err(|e| DavError::Permanent(format!("Invalid server URL {}: {e}", account.url)))?;
        let quirks = match &account.vendor {
            Some(name) => Quirks::from_name(name)
                .ok_or_else(|| DavError::Permanent(format!("Unknown server vendor '{name}'")))?,
            None => Quirks::detect(&start),
        };

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
            .build()
            .map_err(|e| DavError::Permanent(format!("Failed to create HTTP client: {e}")))?;

        debug!(account = %account.name, vendor = quirks.name(), url = %start, "CalDAV client ready");
        Ok(CalDavClient {
            http,
            origin: RwLock::new(start.clone()),
            start,
            username: account.username.clone(),
            password,
            quirks,
        })
    }

    pub fn quirks(&self) -> Quirks {
        self.quirks
    }

    fn resolve(&self, href: &str) -> DavResult<Url> {
        self.origin
            .read()
            .join(href)
            .map_err(|e| DavError::Permanent(format!("Invalid href {href}: {e}")))
    }

    async fn send(
        &self,
        method: Method,
        href: &str,
        headers: HeaderMap,
        body: Option<String>,
    ) -> DavResult<Reply> {
        let url = self.resolve(href)?;
        debug!(method = %method, url = %url, "CalDAV request");

        let mut request = self
            .http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
            .headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        let url = response.url().clone();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(network_error)?;
        Ok(Reply {
            status,
            url,
            etag,
            body,
        })
    }

    /// PROPFIND or REPORT returning a multistatus.
    async fn dav(
        &self,
        method: &'static str,
        href: &str,
        depth: Depth,
        body: String,
    ) -> DavResult<(Multistatus, Reply)> {
        let reply = self.dav_raw(method, href, depth, body).await?;
        if reply.status != StatusCode::MULTI_STATUS && !reply.status.is_success() {
            return Err(status_error(reply.status, href));
        }
        Ok((multistatus::parse(&reply.body)?, reply))
    }

    async fn dav_raw(
        &self,
        method: &'static str,
        href: &str,
        depth: Depth,
        body: String,
    ) -> DavResult<Reply> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| DavError::Permanent(format!("Invalid method {method}: {e}")))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value(XML_CONTENT_TYPE)?);
        headers.insert("depth", header_value(depth.as_str())?);
        for (name, value) in self.quirks.extra_headers() {
            headers.insert(*name, header_value(value)?);
        }
        self.send(method, href, headers, Some(body)).await
    }

    async fn propfind_one(&self, href: &str, body: String) -> DavResult<DavResponse> {
        let (ms, _) = self.dav("PROPFIND", href, Depth::Zero, body).await?;
        let path = url_to_href(href);
        ms.find(&path)
            .or_else(|| ms.responses.first())
            .cloned()
            .ok_or_else(|| DavError::Malformed(format!("Empty PROPFIND answer for {href}")))
    }

    /// Current etag of a resource, for servers that leave it out of a response.
    async fn fetch_etag(&self, href: &str) -> DavResult<Option<String>> {
        match self.propfind_one(href, requests::getetag()).await {
            Ok(response) => Ok(response.etag),
            Err(DavError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Look for the principal starting from `href`.
    async fn principal_at(&self, href: &str) -> DavResult<Option<String>> {
        let (ms, reply) = self
            .dav("PROPFIND", href, Depth::Zero, requests::current_user_principal())
            .await?;
        self.follow_origin(&reply.url);
        Ok(ms.responses.into_iter().find_map(|r| r.principal))
    }

    /// Keep talking to the host we were redirected to.
    fn follow_origin(&self, url: &Url) {
        let mut origin = self.origin.write();
        if origin.host_str() != url.host_str() || origin.port() != url.port() {
            debug!(from = ?origin.host_str(), to = ?url.host_str(), "Following redirect to another host");
            *origin = url.clone();
        }
    }

    /// One GET per href, for servers whose multiget comes back empty.
    async fn fetch_one_by_one(&self, hrefs: &[String]) -> DavResult<Vec<Resource>> {
        let mut resources = Vec::with_capacity(hrefs.len());
        for href in hrefs {
            let reply = self.send(Method::GET, href, HeaderMap::new(), None).await?;
            match reply.status {
                status if status.is_success() => {}
                StatusCode::NOT_FOUND | StatusCode::GONE => continue,
                status => return Err(status_error(status, href)),
            }
            let etag = match reply.etag {
                Some(etag) => etag,
                None => self.fetch_etag(href).await?.unwrap_or_default(),
            };
            resources.push(Resource {
                href: href.clone(),
                etag,
                data: reply.body,
            });
        }
        Ok(resources)
    }

    async fn put(
        &self,
        href: &str,
        body: &str,
        precondition: (HeaderName, &str),
    ) -> DavResult<Reply> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value(ICS_CONTENT_TYPE)?);
        headers.insert(precondition.0, header_value(precondition.1)?);
        self.send(Method::PUT, href, headers, Some(body.to_string())).await
    }
}

impl CalendarRemote for CalDavClient {
    async fn discover_principal(&self) -> DavResult<String> {
        let mut candidates = vec![self.start.path().to_string()];
        candidates.extend(
            self.quirks
                .discovery_paths()
                .iter()
                .map(|p| p.to_string())
                .filter(|p| p != self.start.path()),
        );

        let mut last_error = None;
        for candidate in &candidates {
            match self.principal_at(candidate).await {
                Ok(Some(principal)) => {
                    debug!(principal = %principal, "Found principal");
                    return Ok(url_to_href(&principal));
                }
                Ok(None) => debug!(path = %candidate, "No principal advertised"),
                Err(e @ (DavError::NotFound(_) | DavError::Malformed(_))) => {
                    debug!(path = %candidate, error = %e, "Discovery candidate failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            DavError::NotFound(format!("No current-user-principal below {}", self.start))
        }))
    }

    async fn discover_calendar_homes(&self, principal: &str) -> DavResult<Vec<String>> {
        let response = self
            .propfind_one(principal, requests::calendar_home_set())
            .await?;
        if response.calendar_homes.is_empty() {
            return Err(DavError::NotFound(format!(
                "No calendar-home-set on {principal}"
            )));
        }
        Ok(response
            .calendar_homes
            .iter()
            .map(|h| url_to_href(h))
            .collect())
    }

    async fn list_calendars(&self, home: &str) -> DavResult<Vec<RemoteCalendar>> {
        let (ms, _) = self
            .dav("PROPFIND", home, Depth::One, requests::calendar_list())
            .await?;
        let home = url_to_href(home);

        let calendars = ms
            .responses
            .into_iter()
            .filter(|r| r.is_calendar)
            .map(|r| {
                let href = url_to_href(&r.href);
                let name = r.display_name.unwrap_or_else(|| last_segment(&href));
                RemoteCalendar {
                    href,
                    name,
                    color: r.color,
                    ctag: r.ctag,
                    components: r.components,
                }
            })
            .filter(|c| c.href.trim_end_matches('/') != home.trim_end_matches('/'))
            .filter(|c| self.quirks.accepts_calendar(c))
            .collect::<Vec<_>>();
        debug!(home = %home, count = calendars.len(), "Listed calendars");
        Ok(calendars)
    }

    async fn get_ctag(&self, calendar: &str) -> DavResult<Option<String>> {
        if !self.quirks.supports_ctag() {
            return Ok(None);
        }
        Ok(self.propfind_one(calendar, requests::getctag()).await?.ctag)
    }

    async fn get_sync_token(&self, calendar: &str) -> DavResult<Option<String>> {
        if !self.quirks.supports_sync_collection() {
            return Ok(None);
        }
        Ok(self
            .propfind_one(calendar, requests::sync_token())
            .await?
            .sync_token)
    }

    async fn sync_collection(&self, calendar: &str, token: &str) -> DavResult<ChangeReport> {
        if !self.quirks.supports_sync_collection() {
            return Err(DavError::TokenExpired);
        }
        let reply = self
            .dav_raw("REPORT", calendar, Depth::Zero, requests::sync_collection(token))
            .await?;
        if self.quirks.is_resync_required(reply.status.as_u16(), &reply.body) {
            return Err(DavError::TokenExpired);
        }
        if reply.status != StatusCode::MULTI_STATUS && !reply.status.is_success() {
            return Err(status_error(reply.status, calendar));
        }

        let ms = multistatus::parse(&reply.body)?;
        let collection = url_to_href(calendar);
        let mut report = ChangeReport {
            new_token: ms.sync_token,
            ..Default::default()
        };
        for response in ms.responses {
            let href = url_to_href(&response.href);
            if href.trim_end_matches('/') == collection.trim_end_matches('/') {
                continue;
            }
            match response.status {
                Some(404 | 410) => report.deleted.push(href),
                _ => report.changed.push(ResourceTag {
                    href,
                    etag: response.etag.unwrap_or_default(),
                }),
            }
        }
        debug!(
            calendar = %calendar,
            changed = report.changed.len(),
            deleted = report.deleted.len(),
            "sync-collection"
        );
        Ok(report)
    }

    async fn list_etags(&self, calendar: &str, range: &DateRange) -> DavResult<Vec<ResourceTag>> {
        let body = requests::calendar_query(
            &self.quirks.format_time_range(range.from),
            &self.quirks.format_time_range(range.to),
        );
        let (ms, _) = self.dav("REPORT", calendar, Depth::One, body).await?;
        let collection = url_to_href(calendar);

        let mut tags = Vec::with_capacity(ms.responses.len());
        for response in ms.responses {
            let href = url_to_href(&response.href);
            if href.trim_end_matches('/') == collection.trim_end_matches('/') {
                continue;
            }
            let etag = match response.etag {
                Some(etag) => etag,
                None => match self.fetch_etag(&href).await? {
                    Some(etag) => etag,
                    None => {
                        warn!(href = %href, "Resource has no etag, it will be fetched every sync");
                        String::new()
                    }
                },
            };
            tags.push(ResourceTag { href, etag });
        }
        Ok(tags)
    }

    async fn fetch_resources(&self, calendar: &str, hrefs: &[String]) -> DavResult<Vec<Resource>> {
        if hrefs.is_empty() {
            return Ok(Vec::new());
        }
        let (ms, _) = self
            .dav("REPORT", calendar, Depth::One, requests::calendar_multiget(hrefs))
            .await?;

        let mut resources = Vec::with_capacity(hrefs.len());
        for response in ms.responses {
            let Some(data) = response.calendar_data else {
                continue;
            };
            let href = url_to_href(&response.href);
            let etag = match response.etag {
                Some(etag) => etag,
                None => self.fetch_etag(&href).await?.unwrap_or_default(),
            };
            resources.push(Resource { href, etag, data });
        }

        if resources.is_empty() && hrefs.len() > 1 {
            debug!(calendar = %calendar, count = hrefs.len(), "Empty multiget answer, fetching one by one");
            return self.fetch_one_by_one(hrefs).await;
        }
        Ok(resources)
    }

    async fn create_resource(&self, href: &str, body: &str) -> DavResult<Option<String>> {
        let reply = self.put(href, body, (IF_NONE_MATCH, "*")).await?;
        match reply.status {
            status if status.is_success() => Ok(reply.etag),
            StatusCode::PRECONDITION_FAILED => Err(DavError::AlreadyExists(href.to_string())),
            status => Err(status_error(status, href)),
        }
    }

    async fn update_resource(&self, href: &str, body: &str, etag: &str) -> DavResult<Option<String>> {
        let reply = self.put(href, body, (IF_MATCH, etag)).await?;
        match reply.status {
            status if status.is_success() => Ok(reply.etag),
            status => Err(status_error(status, href)),
        }
    }

    async fn delete_resource(&self, href: &str, etag: Option<&str>) -> DavResult<()> {
        let mut headers = HeaderMap::new();
        if let Some(etag) = etag {
            headers.insert(IF_MATCH, header_value(etag)?);
        }
        let reply = self.send(Method::DELETE, href, headers, None).await?;
        match reply.status {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!(href = %href, "Already deleted on the server");
                Ok(())
            }
            status => Err(status_error(status, href)),
        }
    }
}

fn header_value(value: &str) -> DavResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| DavError::Permanent(format!("Invalid header value {value:?}: {e}")))
}

fn network_error(e: reqwest::Error) -> DavError {
    DavError::Transient(e.to_string())
}

/// Map a non-success status onto the protocol error taxonomy.
fn status_error(status: StatusCode, href: &str) -> DavError {
    match status.as_u16() {
        404 | 410 => DavError::NotFound(href.to_string()),
        412 => DavError::Conflict(href.to_string()),
        401 => DavError::Permanent(format!("Authentication failed for {href}")),
        403 => DavError::Permanent(format!("Access to {href} forbidden")),
        408 | 425 | 429 => DavError::Transient(format!("{status} on {href}")),
        code if code >= 500 => DavError::Transient(format!("{status} on {href}")),
        _ => DavError::Permanent(format!("{status} on {href}")),
    }
}

/// Extract the path from a full URL.
///
/// Converts "https://pXX-caldav.icloud.com/123/calendars/abc/" to "/123/calendars/abc/"
pub fn url_to_href(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    }
}

fn last_segment(href: &str) -> String {
    href.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(href)
        .to_string()
}
