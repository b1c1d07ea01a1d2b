//! Protocol executor contracts consumed by the Execute steps

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;
use warden_crypto::CryptoError;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Enrollment pending (retry after {retry_after:?}s)")]
    Pending { retry_after: Option<u64> },
    #[error("ACME error: {0}")]
    Acme(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

/// Material issued for a server certificate request
#[derive(Debug, Clone)]
pub struct ServerCertificate {
    pub subject: String,
    pub not_after: DateTime<Utc>,
    /// Leaf only
    pub cert_pem: String,
    pub key_pem: String,
    pub fullchain_pem: Option<String>,
    pub chain_pem: Option<String>,
}

/// Server certificate flow (ACME)
#[async_trait]
pub trait ServerCertificateIssuer: Send + Sync {
    /// Obtain a fresh key and certificate for `domain`
    async fn request_server_certificate(
        &self,
        domain: &str,
        ca_url: &str,
        force_renew: bool,
    ) -> Result<ServerCertificate, ProtocolError>;
}

/// Client certificate flow (EST); both calls return the issued PEM
#[async_trait]
pub trait ClientCertificateEnroller: Send + Sync {
    async fn enroll_with_bootstrap(
        &self,
        csr_der: &[u8],
        ca_url: &str,
        bootstrap_token: &str,
    ) -> Result<String, ProtocolError>;

    async fn reenroll_with_mtls(
        &self,
        csr_der: &[u8],
        ca_url: &str,
        existing_cert_path: &Path,
        existing_key_path: &Path,
    ) -> Result<String, ProtocolError>;
}
