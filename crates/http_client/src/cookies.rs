//! The cookie jar: RFC-6265-style matching, `Set-Cookie` parsing, and an
//! optional file-backed persistent variant (atomic tmp+rename writes).

use std::{
    path::{
        Path,
        PathBuf,
    },
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use chrono::{
    DateTime,
    NaiveDateTime,
};
use common::{
    Error,
    ErrorKind,
    Result,
};
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    /// Set when the cookie came without a Domain attribute; it then matches
    /// its origin host exactly, never subdomains.
    pub host_only: bool,
    pub path: String,
    /// Unix seconds; `None` is a session cookie.
    pub expires: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
    /// Creation order, used for header assembly ties.
    pub created_at: i64,
}

impl Cookie {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires, Some(at) if at <= now)
    }

    fn domain_matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if self.host_only {
            return host == self.domain;
        }
        host == self.domain || host.ends_with(&format!(".{}", self.domain))
    }

    fn path_matches(&self, request_path: &str) -> bool {
        if request_path == self.path {
            return true;
        }
        if let Some(rest) = request_path.strip_prefix(&self.path) {
            return self.path.ends_with('/') || rest.starts_with('/');
        }
        false
    }

    fn matches(&self, url: &Url, now: i64) -> bool {
        if self.is_expired(now) {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        if !self.domain_matches(host) {
            return false;
        }
        if !self.path_matches(url.path()) {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        true
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse an HTTP date in any of the three formats servers actually emit.
fn parse_http_date(s: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.timestamp());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%A, %d-%b-%y %H:%M:%S GMT") {
        return Some(naive.and_utc().timestamp());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%a %b %e %H:%M:%S %Y") {
        return Some(naive.and_utc().timestamp());
    }
    None
}

/// The directory of the request path, per the default-path rule.
fn default_path(url: &Url) -> String {
    let path = url.path();
    if !path.starts_with('/') {
        return "/".to_owned();
    }
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => path[..idx].to_owned(),
    }
}

/// Parse one `Set-Cookie` header value against the request it answered.
/// Malformed attributes are skipped; a malformed cookie line or a Domain
/// that doesn't cover the request host drops the whole cookie.
pub fn parse_set_cookie(raw: &str, request_url: &Url) -> Option<Cookie> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let host = request_url.host_str()?.to_ascii_lowercase();

    let mut cookie = Cookie {
        name: name.to_owned(),
        value: value.trim().to_owned(),
        domain: host.clone(),
        host_only: true,
        path: default_path(request_url),
        expires: None,
        secure: false,
        http_only: false,
        same_site: None,
        created_at: 0,
    };
    let mut max_age: Option<i64> = None;

    for part in parts {
        let part = part.trim();
        let (key, attr_value) = match part.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (part, None),
        };
        match key.to_ascii_lowercase().as_str() {
            "path" => {
                if let Some(v) = attr_value {
                    if v.starts_with('/') {
                        cookie.path = v.to_owned();
                    }
                }
            },
            "domain" => {
                if let Some(v) = attr_value {
                    let domain = v.trim_start_matches('.').to_ascii_lowercase();
                    if domain.is_empty() {
                        continue;
                    }
                    if host != domain && !host.ends_with(&format!(".{domain}")) {
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
            },
            "expires" => {
                if let Some(v) = attr_value {
                    cookie.expires = parse_http_date(v).or(cookie.expires);
                }
            },
            "max-age" => {
                if let Some(v) = attr_value {
                    if let Ok(secs) = v.parse::<i64>() {
                        max_age = Some(secs);
                    }
                }
            },
            "secure" => cookie.secure = true,
            "httponly" => cookie.http_only = true,
            "samesite" => cookie.same_site = attr_value.map(|v| v.to_owned()),
            _ => (),
        }
    }

    // Max-Age wins over Expires when both are present.
    if let Some(secs) = max_age {
        cookie.expires = Some(unix_now() + secs.min(i64::MAX / 2));
    }
    Some(cookie)
}

struct JarInner {
    cookies: Vec<Cookie>,
    next_created: i64,
}

pub struct CookieJar {
    inner: Mutex<JarInner>,
    persist_path: Option<PathBuf>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(JarInner {
                cookies: Vec::new(),
                next_created: 1,
            }),
            persist_path: None,
        }
    }

    /// A jar bound to a file: loaded on construction, written atomically by
    /// `save` and on drop.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut cookies: Vec<Cookie> = Vec::new();
        if path.exists() {
            let raw = std::fs::read(&path)?;
            cookies = serde_json::from_slice(&raw).map_err(|e| {
                Error::with_cause(ErrorKind::FileIo, "malformed cookie jar file", e.into())
            })?;
        }
        let now = unix_now();
        cookies.retain(|c| !c.is_expired(now));
        let next_created = cookies.iter().map(|c| c.created_at).max().unwrap_or(0) + 1;
        Ok(Self {
            inner: Mutex::new(JarInner {
                cookies,
                next_created,
            }),
            persist_path: Some(path),
        })
    }

    /// Ingest one `Set-Cookie` header. Last-wins on (name, domain, path);
    /// an already-expired cookie deletes the stored one.
    pub fn store_from_header(&self, raw: &str, request_url: &Url) {
        if let Some(cookie) = parse_set_cookie(raw, request_url) {
            self.store(cookie);
        }
    }

    pub fn store(&self, mut cookie: Cookie) {
        let now = unix_now();
        let mut inner = self.inner.lock();
        let existing = inner.cookies.iter().position(|c| {
            c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
        });
        if cookie.is_expired(now) {
            if let Some(idx) = existing {
                inner.cookies.remove(idx);
            }
            return;
        }
        match existing {
            Some(idx) => {
                // A replacement keeps the original creation order.
                cookie.created_at = inner.cookies[idx].created_at;
                inner.cookies[idx] = cookie;
            },
            None => {
                cookie.created_at = inner.next_created;
                inner.next_created += 1;
                inner.cookies.push(cookie);
            },
        }
    }

    /// Cookies matching an outgoing request, ordered for header assembly:
    /// longest path first, then creation order.
    pub fn matching(&self, url: &Url) -> Vec<Cookie> {
        let now = unix_now();
        let mut matched: Vec<Cookie> = self
            .inner
            .lock()
            .cookies
            .iter()
            .filter(|c| c.matches(url, now))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.created_at.cmp(&b.created_at))
        });
        matched
    }

    /// The `Cookie` header for a request, if any cookie matches.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let matched = self.matching(url);
        if matched.is_empty() {
            return None;
        }
        Some(
            matched
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    pub fn get(&self, name: &str) -> Option<Cookie> {
        let now = unix_now();
        self.inner
            .lock()
            .cookies
            .iter()
            .find(|c| c.name == name && !c.is_expired(now))
            .cloned()
    }

    pub fn all(&self) -> Vec<Cookie> {
        let now = unix_now();
        self.inner
            .lock()
            .cookies
            .iter()
            .filter(|c| !c.is_expired(now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().cookies.clear();
    }

    /// Write the jar to its file: tmp file in the same directory, then
    /// rename over the target.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Err(Error::usage("cookie jar has no backing file"));
        };
        let cookies = self.all();
        let encoded = serde_json::to_vec_pretty(&cookies)
            .map_err(|e| Error::with_cause(ErrorKind::FileIo, "cookie jar encode failed", e.into()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Drop for CookieJar {
    fn drop(&mut self) {
        if self.persist_path.is_some() {
            if let Err(e) = self.save() {
                tracing::warn!("failed to persist cookie jar: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_parse_basic_set_cookie() {
        let cookie =
            parse_set_cookie("session_id=ABC; Path=/", &url("http://example.com/login")).unwrap();
        assert_eq!(cookie.name, "session_id");
        assert_eq!(cookie.value, "ABC");
        assert_eq!(cookie.path, "/");
        assert_eq!(cookie.domain, "example.com");
        assert!(cookie.host_only);
        assert!(cookie.expires.is_none());
    }

    #[test]
    fn test_parse_attributes() {
        let cookie = parse_set_cookie(
            "id=1; Domain=example.com; Path=/app; Secure; HttpOnly; SameSite=Lax; Max-Age=60",
            &url("https://www.example.com/app/login"),
        )
        .unwrap();
        assert_eq!(cookie.domain, "example.com");
        assert!(!cookie.host_only);
        assert_eq!(cookie.path, "/app");
        assert!(cookie.secure);
        assert!(cookie.http_only);
        assert_eq!(cookie.same_site.as_deref(), Some("Lax"));
        assert!(cookie.expires.unwrap() > unix_now());
    }

    #[test]
    fn test_domain_attribute_must_cover_request_host() {
        assert!(parse_set_cookie(
            "id=1; Domain=evil.com",
            &url("http://example.com/")
        )
        .is_none());
    }

    #[test]
    fn test_expires_formats() {
        let u = url("http://example.com/");
        for raw in [
            "t=1; Expires=Thu, 01 Jan 1970 00:00:10 GMT",
            "t=1; Expires=Thursday, 01-Jan-70 00:00:10 GMT",
            "t=1; Expires=Thu Jan  1 00:00:10 1970",
        ] {
            let cookie = parse_set_cookie(raw, &u).unwrap();
            assert_eq!(cookie.expires, Some(10), "failed on {raw}");
        }
    }

    #[test]
    fn test_jar_matching_rules() {
        let jar = CookieJar::new();
        jar.store_from_header("a=1; Path=/", &url("http://example.com/"));
        jar.store_from_header("b=2; Path=/admin", &url("http://example.com/admin/x"));
        jar.store_from_header("c=3; Secure", &url("https://example.com/"));
        jar.store_from_header("d=4; Domain=example.com", &url("http://sub.example.com/"));

        // Plain http to the apex: no secure cookie, no subdomain-stored
        // host-only cookie.
        let matched = jar.matching(&url("http://example.com/"));
        let names: Vec<_> = matched.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "d"]);

        // Path matching picks up /admin under /admin, longest path first.
        let matched = jar.matching(&url("http://example.com/admin/panel"));
        let names: Vec<_> = matched.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "d"]);

        // /administrator is not a path-match for /admin.
        let matched = jar.matching(&url("http://example.com/administrator"));
        let names: Vec<_> = matched.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "d"]);

        // https sees the secure cookie too.
        let matched = jar.matching(&url("https://example.com/"));
        let names: Vec<_> = matched.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_host_only_vs_domain_cookie() {
        let jar = CookieJar::new();
        jar.store_from_header("host=1", &url("http://example.com/"));
        jar.store_from_header("dom=1; Domain=example.com", &url("http://example.com/"));
        let matched = jar.matching(&url("http://api.example.com/"));
        let names: Vec<_> = matched.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["dom"]);
    }

    #[test]
    fn test_last_wins_and_expired_deletes() {
        let jar = CookieJar::new();
        let u = url("http://example.com/");
        jar.store_from_header("session=old; Path=/", &u);
        jar.store_from_header("session=new; Path=/", &u);
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.get("session").unwrap().value, "new");

        jar.store_from_header("session=gone; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT", &u);
        assert!(jar.is_empty());
    }

    #[test]
    fn test_header_assembly_order() {
        let jar = CookieJar::new();
        let u = url("http://example.com/a/b");
        jar.store_from_header("first=1; Path=/", &u);
        jar.store_from_header("deep=2; Path=/a/b", &u);
        jar.store_from_header("second=3; Path=/", &u);
        assert_eq!(
            jar.header_for(&u).unwrap(),
            "deep=2; first=1; second=3"
        );
    }

    #[test]
    fn test_persistent_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        {
            let jar = CookieJar::persistent(&path).unwrap();
            jar.store_from_header("keep=yes; Max-Age=3600", &url("http://example.com/"));
            jar.store_from_header("session=tmp", &url("http://example.com/"));
            jar.save().unwrap();
        }
        let reloaded = CookieJar::persistent(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("keep").unwrap().value, "yes");
        // Round trip preserves the cookie set exactly.
        let jar2 = CookieJar::persistent(&path).unwrap();
        assert_eq!(reloaded.all(), jar2.all());
    }
}
