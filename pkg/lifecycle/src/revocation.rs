//! Revocation checking against a locally cached CRL
//!
//! Every failure here is fail-open: an unreachable distribution point or an
//! unreadable cache never blocks renewal and never marks a certificate
//! revoked.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use warden_crypto::{
    normalize_serial, parse_revoked_serials, write_atomic, CrlError, InstallError, CERT_MODE,
};

const METADATA_SUFFIX: &str = ".meta.json";
const MAX_AGE_CAP_HOURS: u64 = 24 * 365 * 10;

#[derive(Error, Debug)]
pub enum RevocationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("CRL distribution point returned {0}")]
    Status(u16),
    #[error("Fetched CRL is unusable: {0}")]
    Crl(#[from] CrlError),
    #[error("Failed to store CRL: {0}")]
    Store(#[from] InstallError),
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Sidecar describing where and when the cached CRL came from
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMetadata {
    url: String,
    fetched_at: DateTime<Utc>,
    max_age_hours: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub updated: bool,
}

/// Path of the metadata sidecar for `cache_path`
pub fn metadata_path(cache_path: &Path) -> PathBuf {
    let mut name = cache_path.as_os_str().to_owned();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct RevocationValidator {
    client: reqwest::Client,
}

impl RevocationValidator {
    pub fn new(timeout: Duration) -> Result<Self, RevocationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Refresh the cache at `cache_path` from `url` unless it is still fresh
    ///
    /// Fetch, parse and store failures are logged and reported as
    /// `updated: false`; the existing cache is left untouched.
    pub async fn refresh_cache(&self, url: &str, cache_path: &Path, max_age_hours: u64) -> RefreshOutcome {
        if is_fresh(url, cache_path, max_age_hours, Utc::now()) {
            debug!(url, cache_path = %cache_path.display(), "CRL cache is fresh");
            return RefreshOutcome { updated: false };
        }

        match self.fetch_and_store(url, cache_path, max_age_hours).await {
            Ok(revoked) => {
                info!(url, cache_path = %cache_path.display(), revoked, "CRL cache refreshed");
                RefreshOutcome { updated: true }
            }
            Err(e) => {
                warn!(
                    url,
                    cache_path = %cache_path.display(),
                    stale_cache = cache_path.exists(),
                    error = %e,
                    "CRL refresh failed, continuing with existing cache"
                );
                RefreshOutcome { updated: false }
            }
        }
    }

    /// Whether `serial` is listed in the cached CRL
    ///
    /// A missing or unparsable cache answers `false`.
    pub fn is_revoked(&self, serial: &str, cache_path: &Path) -> bool {
        let raw = match fs::read(cache_path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(cache_path = %cache_path.display(), error = %e, "No CRL cache, treating as not revoked");
                return false;
            }
        };

        match parse_revoked_serials(&raw) {
            Ok(serials) => serials.contains(&normalize_serial(serial)),
            Err(e) => {
                warn!(cache_path = %cache_path.display(), error = %e, "Cached CRL unreadable, treating as not revoked");
                false
            }
        }
    }

    async fn fetch_and_store(
        &self,
        url: &str,
        cache_path: &Path,
        max_age_hours: u64,
    ) -> Result<usize, RevocationError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RevocationError::Status(status.as_u16()));
        }
        let raw = response.bytes().await?;

        // Refuse to replace a usable cache with something unparsable.
        let revoked = parse_revoked_serials(&raw)?.len();

        let metadata = CacheMetadata {
            url: url.to_string(),
            fetched_at: Utc::now(),
            max_age_hours,
        };
        write_atomic(cache_path, &raw, CERT_MODE)?;
        write_atomic(
            &metadata_path(cache_path),
            &serde_json::to_vec_pretty(&metadata)?,
            CERT_MODE,
        )?;

        Ok(revoked)
    }
}

fn is_fresh(url: &str, cache_path: &Path, max_age_hours: u64, now: DateTime<Utc>) -> bool {
    if !cache_path.exists() {
        return false;
    }
    let Ok(raw) = fs::read(metadata_path(cache_path)) else {
        return false;
    };
    let Ok(metadata) = serde_json::from_slice::<CacheMetadata>(&raw) else {
        return false;
    };

    let hours = i64::try_from(max_age_hours.min(MAX_AGE_CAP_HOURS)).unwrap_or(0);
    let max_age = ChronoDuration::hours(hours);
    metadata.url == url && now - metadata.fetched_at <= max_age
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use warden_crypto::testing::{REVOKED_CRL_DER, REVOKED_CRL_PEM, REVOKED_SERIALS};

    const UNREACHABLE: &str = "http://127.0.0.1:1/crl";

    async fn serve_crl(status: StatusCode, body: &'static [u8]) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/crl",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (status, body.to_vec())
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/crl"), hits)
    }

    fn validator() -> RevocationValidator {
        RevocationValidator::new(Duration::from_secs(5)).unwrap()
    }

    fn seed_cache(cache_path: &Path, url: &str, fetched_at: DateTime<Utc>) {
        fs::write(cache_path, REVOKED_CRL_PEM).unwrap();
        let metadata = CacheMetadata {
            url: url.to_string(),
            fetched_at,
            max_age_hours: 24,
        };
        fs::write(metadata_path(cache_path), serde_json::to_vec(&metadata).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_fetch_populates_cache() {
        let temp_dir = TempDir::new().unwrap();
        let cache_path = temp_dir.path().join("crl").join("ca.crl");
        let (url, hits) = serve_crl(StatusCode::OK, REVOKED_CRL_DER).await;
        let validator = validator();

        let outcome = validator.refresh_cache(&url, &cache_path, 24).await;

        assert!(outcome.updated);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(&cache_path).unwrap(), REVOKED_CRL_DER);
        assert!(metadata_path(&cache_path).exists());
        for serial in REVOKED_SERIALS {
            assert!(validator.is_revoked(serial, &cache_path));
        }
        assert!(validator.is_revoked("10:01", &cache_path));
        assert!(!validator.is_revoked("3001", &cache_path));
    }

    #[tokio::test]
    async fn test_fresh_cache_is_not_refetched() {
        let temp_dir = TempDir::new().unwrap();
        let cache_path = temp_dir.path().join("ca.crl");
        let (url, hits) = serve_crl(StatusCode::OK, REVOKED_CRL_PEM).await;
        let validator = validator();

        assert!(validator.refresh_cache(&url, &cache_path, 24).await.updated);
        assert!(!validator.refresh_cache(&url, &cache_path, 24).await.updated);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_or_foreign_cache_is_refetched() {
        let temp_dir = TempDir::new().unwrap();
        let cache_path = temp_dir.path().join("ca.crl");
        let (url, hits) = serve_crl(StatusCode::OK, REVOKED_CRL_PEM).await;
        let validator = validator();

        seed_cache(&cache_path, &url, Utc::now() - ChronoDuration::hours(25));
        assert!(validator.refresh_cache(&url, &cache_path, 24).await.updated);

        seed_cache(&cache_path, "http://other.example/crl", Utc::now());
        assert!(validator.refresh_cache(&url, &cache_path, 24).await.updated);

        fs::remove_file(metadata_path(&cache_path)).unwrap();
        assert!(validator.refresh_cache(&url, &cache_path, 24).await.updated);

        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_fails_open_and_keeps_cache() {
        let temp_dir = TempDir::new().unwrap();
        let cache_path = temp_dir.path().join("ca.crl");
        seed_cache(&cache_path, UNREACHABLE, Utc::now() - ChronoDuration::hours(48));
        let before = fs::read(&cache_path).unwrap();
        let validator = validator();

        let outcome = validator.refresh_cache(UNREACHABLE, &cache_path, 24).await;

        assert!(!outcome.updated);
        assert_eq!(fs::read(&cache_path).unwrap(), before);
        // The stale list is still consulted.
        assert!(validator.is_revoked("1001", &cache_path));
    }

    #[tokio::test]
    async fn test_unreachable_without_cache_is_not_revoked() {
        let temp_dir = TempDir::new().unwrap();
        let cache_path = temp_dir.path().join("ca.crl");
        let validator = validator();

        let outcome = validator.refresh_cache(UNREACHABLE, &cache_path, 24).await;

        assert!(!outcome.updated);
        assert!(!cache_path.exists());
        assert!(!validator.is_revoked("1001", &cache_path));
    }

    #[tokio::test]
    async fn test_error_status_and_garbage_keep_cache() {
        let temp_dir = TempDir::new().unwrap();
        let cache_path = temp_dir.path().join("ca.crl");
        let validator = validator();

        let (failing, _) = serve_crl(StatusCode::INTERNAL_SERVER_ERROR, b"").await;
        seed_cache(&cache_path, &failing, Utc::now() - ChronoDuration::hours(48));
        assert!(!validator.refresh_cache(&failing, &cache_path, 24).await.updated);
        assert_eq!(fs::read(&cache_path).unwrap(), REVOKED_CRL_PEM);

        let (garbage, _) = serve_crl(StatusCode::OK, b"<html>maintenance</html>").await;
        assert!(!validator.refresh_cache(&garbage, &cache_path, 24).await.updated);
        assert_eq!(fs::read(&cache_path).unwrap(), REVOKED_CRL_PEM);
    }

    #[tokio::test]
    async fn test_unparsable_cache_is_not_revoked() {
        let temp_dir = TempDir::new().unwrap();
        let cache_path = temp_dir.path().join("ca.crl");
        fs::write(&cache_path, b"corrupted").unwrap();

        assert!(!validator().is_revoked("1001", &cache_path));
    }
}
