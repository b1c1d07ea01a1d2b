//! EST (RFC 7030) enrollment for client certificates
//!
//! `simpleenroll` authenticates with a bearer bootstrap token;
//! `simplereenroll` authenticates with the certificate being replaced.
//! Both post a base64 PKCS#10 body and accept either a base64 PKCS#7
//! certs-only response or plain PEM.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::pkcs7::Pkcs7;
use reqwest::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Certificate, Client, Identity, StatusCode};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_config::EstConfig;
use warden_crypto::pem_certificates;

use crate::executor::{ClientCertificateEnroller, ProtocolError};

const PKCS10_CONTENT_TYPE: &str = "application/pkcs10";
const CONTENT_TRANSFER_ENCODING: &str = "content-transfer-encoding";
const PEM_MARKER: &str = "-----BEGIN CERTIFICATE-----";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Enroll,
    Reenroll,
}

impl Operation {
    fn path(self) -> &'static str {
        match self {
            Operation::Enroll => "simpleenroll",
            Operation::Reenroll => "simplereenroll",
        }
    }
}

pub struct EstEnroller {
    roots: Vec<Certificate>,
    timeout: Duration,
    bootstrap_client: Client,
}

impl EstEnroller {
    pub fn new(config: &EstConfig) -> Result<Self, ProtocolError> {
        let roots = match &config.ca_bundle_path {
            Some(path) => load_roots(path)?,
            None => Vec::new(),
        };
        let timeout = Duration::from_secs(config.request_timeout_seconds);
        let bootstrap_client = client_builder(&roots, timeout).build()?;

        Ok(Self {
            roots,
            timeout,
            bootstrap_client,
        })
    }

    fn mtls_client(&self, cert_path: &Path, key_path: &Path) -> Result<Client, ProtocolError> {
        let mut pem = fs::read(cert_path).map_err(|e| {
            ProtocolError::MissingCredential(format!("{}: {e}", cert_path.display()))
        })?;
        pem.push(b'\n');
        pem.extend(fs::read(key_path).map_err(|e| {
            ProtocolError::MissingCredential(format!("{}: {e}", key_path.display()))
        })?);

        let identity = Identity::from_pem(&pem)?;
        Ok(client_builder(&self.roots, self.timeout)
            .identity(identity)
            .build()?)
    }

    async fn submit(
        &self,
        client: &Client,
        operation: Operation,
        ca_url: &str,
        csr_der: &[u8],
        bootstrap_token: Option<&str>,
    ) -> Result<String, ProtocolError> {
        let url = endpoint(ca_url, operation);
        debug!(url = %url, "Submitting EST request");

        let mut request = client
            .post(&url)
            .header(CONTENT_TYPE, PKCS10_CONTENT_TYPE)
            .header(CONTENT_TRANSFER_ENCODING, "base64")
            .body(STANDARD.encode(csr_der));
        if let Some(token) = bootstrap_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::ACCEPTED {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v: &HeaderValue| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            warn!(url = %url, ?retry_after, "EST enrollment pending");
            return Err(ProtocolError::Pending { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProtocolError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        let pem = decode_enrollment_response(&body)?;
        info!(url = %url, certificates = pem_certificates(&pem).len(), "EST enrollment completed");
        Ok(pem)
    }
}

#[async_trait]
impl ClientCertificateEnroller for EstEnroller {
    async fn enroll_with_bootstrap(
        &self,
        csr_der: &[u8],
        ca_url: &str,
        bootstrap_token: &str,
    ) -> Result<String, ProtocolError> {
        self.submit(
            &self.bootstrap_client,
            Operation::Enroll,
            ca_url,
            csr_der,
            Some(bootstrap_token),
        )
        .await
    }

    async fn reenroll_with_mtls(
        &self,
        csr_der: &[u8],
        ca_url: &str,
        existing_cert_path: &Path,
        existing_key_path: &Path,
    ) -> Result<String, ProtocolError> {
        let client = self.mtls_client(existing_cert_path, existing_key_path)?;
        self.submit(&client, Operation::Reenroll, ca_url, csr_der, None)
            .await
    }
}

fn client_builder(roots: &[Certificate], timeout: Duration) -> reqwest::ClientBuilder {
    roots
        .iter()
        .cloned()
        .fold(Client::builder().timeout(timeout), |builder, root| {
            builder.add_root_certificate(root)
        })
}

fn load_roots(path: &Path) -> Result<Vec<Certificate>, ProtocolError> {
    let bundle = fs::read_to_string(path)?;
    let roots = pem_certificates(&bundle)
        .iter()
        .map(|pem| Certificate::from_pem(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()?;
    if roots.is_empty() {
        return Err(ProtocolError::InvalidResponse(format!(
            "no certificates in CA bundle {}",
            path.display()
        )));
    }
    Ok(roots)
}

fn endpoint(ca_url: &str, operation: Operation) -> String {
    format!("{}/{}", ca_url.trim_end_matches('/'), operation.path())
}

/// Turn an EST enrollment response into a PEM bundle, leaf first
///
/// PEM bodies pass through. Anything else is taken as a PKCS#7 certs-only
/// structure, base64 encoded or raw DER.
pub fn decode_enrollment_response(body: &[u8]) -> Result<String, ProtocolError> {
    let text = String::from_utf8_lossy(body);
    if text.contains(PEM_MARKER) {
        return Ok(text.into_owned());
    }

    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let der = STANDARD
        .decode(compact.as_bytes())
        .unwrap_or_else(|_| body.to_vec());

    let pkcs7 = Pkcs7::from_der(&der)
        .map_err(|e| ProtocolError::InvalidResponse(format!("not a PKCS#7 structure: {e}")))?;
    let certificates = pkcs7
        .signed()
        .and_then(|signed| signed.certificates())
        .ok_or_else(|| {
            ProtocolError::InvalidResponse("PKCS#7 response carries no certificates".to_string())
        })?;

    let mut pem = String::new();
    for cert in certificates {
        let block = cert
            .to_pem()
            .map_err(|e| ProtocolError::InvalidResponse(e.to_string()))?;
        pem.push_str(&String::from_utf8_lossy(&block));
    }
    if pem.is_empty() {
        return Err(ProtocolError::InvalidResponse(
            "PKCS#7 response carries no certificates".to_string(),
        ));
    }
    Ok(pem)
}
