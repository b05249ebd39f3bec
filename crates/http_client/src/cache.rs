//! The response cache: an in-memory LRU keyed by request fingerprint, with
//! an optional directory-sharded disk layer consulted on memory misses and
//! promoted back on hit.
//!
//! Cache failures are never fatal to a request; they degrade to a miss and
//! a warning.
//!
//! Concurrent requests with the same fingerprint are independent misses by
//! default. Opting into single-flight makes the first request the leader
//! and hands its outcome to every follower.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::PathBuf,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use bytes::Bytes;
use http::Method;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use sha2::{
    Digest,
    Sha256,
};

use crate::{
    metrics,
    request::HttpRequest,
};

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub disk_root: Option<PathBuf>,
    pub single_flight: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: *common::knobs::HTTP_CACHE_MAX_ENTRIES,
            disk_root: None,
            single_flight: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub stored_at: SystemTime,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        match self.stored_at.checked_add(self.ttl) {
            Some(deadline) => now < deadline,
            None => true,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DiskMeta {
    status: u16,
    headers: Vec<(String, String)>,
    stored_at_unix_ms: u64,
    ttl_ms: u64,
}

/// Stable identity of a request for cache lookup: method, normalized URI,
/// any request headers declared as varying, and (opt-in, non-GET) the body.
pub fn fingerprint(request: &HttpRequest, vary_headers: &[String], include_body: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.url.as_str().as_bytes());
    hasher.update(b"\n");
    let mut vary: Vec<String> = vary_headers.iter().map(|h| h.to_ascii_lowercase()).collect();
    vary.sort();
    for name in vary {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        if let Some(value) = request.header_str(&name) {
            hasher.update(value.as_bytes());
        }
        hasher.update(b"\n");
    }
    if include_body && request.method != Method::GET {
        if let Some(body) = &request.body {
            hasher.update(body);
        }
    }
    hex::encode(hasher.finalize())
}

type FlightResult = Option<CacheEntry>;

pub enum Flight {
    /// This request does the transport work and must call
    /// [`HttpCache::complete_flight`].
    Leader(async_broadcast::Sender<FlightResult>),
    /// This request waits for the leader's outcome.
    Follower(async_broadcast::Receiver<FlightResult>),
}

pub struct HttpCache {
    memory: Mutex<LruCache<String, CacheEntry>>,
    pending: Mutex<HashMap<String, async_broadcast::Receiver<FlightResult>>>,
    config: CacheConfig,
}

impl HttpCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).expect("max(1) is nonzero");
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            pending: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn single_flight_enabled(&self) -> bool {
        self.config.single_flight
    }

    pub fn lookup(&self, fp: &str) -> Option<CacheEntry> {
        let now = SystemTime::now();
        {
            let mut memory = self.memory.lock();
            match memory.get(fp) {
                Some(entry) if entry.is_fresh(now) => {
                    metrics::log_cache_hit();
                    return Some(entry.clone());
                },
                Some(_) => {
                    memory.pop(fp);
                },
                None => (),
            }
        }
        let entry = self.lookup_disk(fp, now)?;
        // Promote the disk hit so the next lookup stays in memory.
        self.memory.lock().put(fp.to_owned(), entry.clone());
        metrics::log_cache_hit();
        Some(entry)
    }

    pub fn store(&self, fp: &str, entry: CacheEntry) {
        self.memory.lock().put(fp.to_owned(), entry.clone());
        if let Err(e) = self.store_disk(fp, &entry) {
            tracing::warn!("cache write for {fp} failed: {e}");
        }
        metrics::log_cache_store();
    }

    /// Join or start a single-flight for this fingerprint. `None` when
    /// single-flight is disabled and every miss goes to transport.
    pub fn begin_flight(&self, fp: &str) -> Option<Flight> {
        if !self.config.single_flight {
            return None;
        }
        let mut pending = self.pending.lock();
        if let Some(receiver) = pending.get(fp) {
            return Some(Flight::Follower(receiver.clone()));
        }
        let (sender, receiver) = async_broadcast::broadcast(1);
        pending.insert(fp.to_owned(), receiver);
        Some(Flight::Leader(sender))
    }

    /// Publish the leader's outcome to every follower and retire the
    /// flight.
    pub fn complete_flight(
        &self,
        fp: &str,
        sender: async_broadcast::Sender<FlightResult>,
        outcome: FlightResult,
    ) {
        let receiver = self.pending.lock().remove(fp);
        let _ = sender.try_broadcast(outcome);
        drop(receiver);
    }

    pub fn clear(&self) {
        self.memory.lock().clear();
        self.pending.lock().clear();
        if let Some(root) = &self.config.disk_root {
            if root.exists() {
                let _ = std::fs::remove_dir_all(root);
            }
        }
    }

    fn entry_paths(&self, fp: &str) -> Option<(PathBuf, PathBuf)> {
        let root = self.config.disk_root.as_ref()?;
        let shard = root.join(&fp[..2.min(fp.len())]);
        Some((shard.join(format!("{fp}.meta.json")), shard.join(format!("{fp}.body"))))
    }

    fn lookup_disk(&self, fp: &str, now: SystemTime) -> Option<CacheEntry> {
        let (meta_path, body_path) = self.entry_paths(fp)?;
        let raw = std::fs::read(&meta_path).ok()?;
        let meta: DiskMeta = match serde_json::from_slice(&raw) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("malformed cache metadata for {fp}: {e}");
                return None;
            },
        };
        let body = std::fs::read(&body_path).ok()?;
        let entry = CacheEntry {
            status: meta.status,
            headers: meta.headers,
            body: Bytes::from(body),
            stored_at: UNIX_EPOCH + Duration::from_millis(meta.stored_at_unix_ms),
            ttl: Duration::from_millis(meta.ttl_ms),
        };
        if !entry.is_fresh(now) {
            let _ = std::fs::remove_file(&meta_path);
            let _ = std::fs::remove_file(&body_path);
            return None;
        }
        Some(entry)
    }

    fn store_disk(&self, fp: &str, entry: &CacheEntry) -> std::io::Result<()> {
        let Some((meta_path, body_path)) = self.entry_paths(fp) else {
            return Ok(());
        };
        let shard = meta_path.parent().expect("entry path has a shard directory");
        std::fs::create_dir_all(shard)?;
        let meta = DiskMeta {
            status: entry.status,
            headers: entry.headers.clone(),
            stored_at_unix_ms: entry
                .stored_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            ttl_ms: entry.ttl.as_millis() as u64,
        };
        let encoded = serde_json::to_vec(&meta).expect("metadata serializes");
        // Atomic writes: tmp then rename, body first so a visible meta file
        // always has its body.
        let body_tmp = body_path.with_extension("body.tmp");
        std::fs::write(&body_tmp, &entry.body)?;
        std::fs::rename(&body_tmp, &body_path)?;
        let meta_tmp = meta_path.with_extension("json.tmp");
        std::fs::write(&meta_tmp, encoded)?;
        std::fs::rename(&meta_tmp, &meta_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use http::Method;
    use url::Url;

    use super::*;

    fn request(method: Method, url: &str) -> HttpRequest {
        HttpRequest::new(method, Url::parse(url).unwrap())
    }

    fn entry(body: &str, ttl: Duration) -> CacheEntry {
        CacheEntry {
            status: 200,
            headers: vec![("content-type".to_owned(), "text/plain".to_owned())],
            body: Bytes::from(body.to_owned()),
            stored_at: SystemTime::now(),
            ttl,
        }
    }

    #[test]
    fn test_fingerprint_distinguishes_method_url_and_vary() {
        let get = request(Method::GET, "http://example.com/a");
        let post = request(Method::POST, "http://example.com/a");
        let other = request(Method::GET, "http://example.com/b");
        assert_ne!(fingerprint(&get, &[], false), fingerprint(&post, &[], false));
        assert_ne!(fingerprint(&get, &[], false), fingerprint(&other, &[], false));

        let mut with_header = request(Method::GET, "http://example.com/a");
        with_header
            .headers
            .insert("accept", "application/json".parse().unwrap());
        assert_eq!(
            fingerprint(&get, &[], false),
            fingerprint(&with_header, &[], false)
        );
        assert_ne!(
            fingerprint(&get, &["accept".to_owned()], false),
            fingerprint(&with_header, &["accept".to_owned()], false)
        );
    }

    #[test]
    fn test_fingerprint_body_opt_in_is_non_get_only() {
        let mut post_a = request(Method::POST, "http://example.com/a");
        post_a.body = Some(Bytes::from_static(b"one"));
        let mut post_b = request(Method::POST, "http://example.com/a");
        post_b.body = Some(Bytes::from_static(b"two"));
        assert_eq!(fingerprint(&post_a, &[], false), fingerprint(&post_b, &[], false));
        assert_ne!(fingerprint(&post_a, &[], true), fingerprint(&post_b, &[], true));
    }

    #[test]
    fn test_memory_hit_until_ttl() {
        let cache = HttpCache::new(CacheConfig::default());
        cache.store("fp1", entry("cached", Duration::from_secs(60)));
        assert_eq!(cache.lookup("fp1").unwrap().body, Bytes::from_static(b"cached"));

        cache.store("fp2", entry("stale", Duration::ZERO));
        assert!(cache.lookup("fp2").is_none());
    }

    #[test]
    fn test_lru_bound_evicts_oldest() {
        let cache = HttpCache::new(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        cache.store("a", entry("a", Duration::from_secs(60)));
        cache.store("b", entry("b", Duration::from_secs(60)));
        cache.store("c", entry("c", Duration::from_secs(60)));
        assert!(cache.lookup("a").is_none());
        assert!(cache.lookup("b").is_some());
        assert!(cache.lookup("c").is_some());
    }

    #[test]
    fn test_disk_round_trip_and_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            disk_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let cache = HttpCache::new(config.clone());
        cache.store("abcdef", entry("persisted", Duration::from_secs(60)));

        // A fresh cache over the same directory misses memory and promotes
        // from disk.
        let reopened = HttpCache::new(config);
        let hit = reopened.lookup("abcdef").unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, Bytes::from_static(b"persisted"));
        // Second lookup is served from memory even if the files vanish.
        std::fs::remove_dir_all(dir.path()).unwrap();
        assert!(reopened.lookup("abcdef").is_some());
    }

    #[test]
    fn test_single_flight_leader_then_followers() {
        let cache = HttpCache::new(CacheConfig {
            single_flight: true,
            ..Default::default()
        });
        let Some(Flight::Leader(sender)) = cache.begin_flight("fp") else {
            panic!("expected to lead the first flight");
        };
        let Some(Flight::Follower(mut receiver)) = cache.begin_flight("fp") else {
            panic!("expected to follow the in-progress flight");
        };
        cache.complete_flight("fp", sender, Some(entry("shared", Duration::from_secs(1))));
        let outcome = receiver.try_recv().unwrap().unwrap();
        assert_eq!(outcome.body, Bytes::from_static(b"shared"));
        // The flight is retired; the next request leads again.
        assert!(matches!(cache.begin_flight("fp"), Some(Flight::Leader(_))));
    }
}
