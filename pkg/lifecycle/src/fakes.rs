//! Recording protocol executors and helpers for lifecycle tests

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::x509::{X509Name, X509NameRef, X509Req, X509};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use warden_config::CrlConfig;
use warden_crypto::testing::{issue_test_certificate, REVOKED_CRL_PEM};

use crate::executor::{
    ClientCertificateEnroller, ProtocolError, ServerCertificate, ServerCertificateIssuer,
};
use crate::revocation::RevocationValidator;

pub fn test_validator() -> RevocationValidator {
    RevocationValidator::new(Duration::from_secs(5)).unwrap()
}

pub fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

/// Serve the fixture CRL on an ephemeral port
pub async fn serve_crl() -> String {
    let app = Router::new().route("/crl", get(|| async { REVOKED_CRL_PEM.to_vec() }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/crl")
}

pub fn crl_target(url: &str, cache_path: &Path) -> CrlConfig {
    CrlConfig {
        enabled: true,
        url: Some(url.to_string()),
        cache_path: Some(cache_path.to_path_buf()),
        max_age_hours: 24,
    }
}

fn unavailable() -> ProtocolError {
    ProtocolError::Status {
        status: 503,
        body: "CA unavailable".to_string(),
    }
}

fn signed_by<T: HasPublic>(
    subject: &X509NameRef,
    key: &PKeyRef<T>,
    issuer: &X509NameRef,
    ca_key: &PKeyRef<Private>,
) -> String {
    let now = Utc::now();
    let not_before = Asn1Time::from_unix(now.timestamp()).unwrap();
    let not_after = Asn1Time::from_unix((now + ChronoDuration::days(90)).timestamp()).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(subject).unwrap();
    builder.set_issuer_name(issuer).unwrap();
    builder.set_pubkey(key).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();
    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
}

/// Leaf for the CSR's key and subject, and the self-signed issuer behind it
fn sign_csr(csr_der: &[u8]) -> (String, String) {
    let request = X509Req::from_der(csr_der).unwrap();
    let request_key = request.public_key().unwrap();
    assert!(request.verify(&request_key).unwrap());

    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let ca_key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
    let mut issuer = X509Name::builder().unwrap();
    issuer.append_entry_by_text("CN", "Warden Test CA").unwrap();
    let issuer = issuer.build();

    let leaf = signed_by(request.subject_name(), &request_key, &issuer, &ca_key);
    let ca = signed_by(&issuer, &ca_key, &issuer, &ca_key);
    (leaf, ca)
}

/// Server issuer recording `(domain, ca_url, force_renew)` per call
#[derive(Default)]
pub struct RecordingIssuer {
    calls: Mutex<Vec<(String, String, bool)>>,
    fail: bool,
}

impl RecordingIssuer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, String, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServerCertificateIssuer for RecordingIssuer {
    async fn request_server_certificate(
        &self,
        domain: &str,
        ca_url: &str,
        force_renew: bool,
    ) -> Result<ServerCertificate, ProtocolError> {
        let serial = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((domain.to_string(), ca_url.to_string(), force_renew));
            u32::try_from(calls.len()).unwrap() + 0x5000
        };
        if self.fail {
            return Err(unavailable());
        }

        let now = Utc::now();
        let not_after = now + ChronoDuration::days(90);
        let cert = issue_test_certificate(domain, serial, now, not_after).unwrap();
        Ok(ServerCertificate {
            subject: format!("CN={domain}"),
            not_after,
            fullchain_pem: Some(cert.cert_pem.clone()),
            chain_pem: None,
            cert_pem: cert.cert_pem,
            key_pem: cert.key_pem,
        })
    }
}

/// Client enroller recording bootstrap tokens and mTLS credential paths
#[derive(Default)]
pub struct RecordingEnroller {
    bootstrap_calls: Mutex<Vec<(String, String)>>,
    mtls_calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    fail: bool,
    issuer_first: bool,
}

impl RecordingEnroller {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Responds with the issuer certificate ahead of the leaf
    pub fn issuer_first() -> Self {
        Self {
            issuer_first: true,
            ..Self::default()
        }
    }

    fn respond(&self, csr_der: &[u8]) -> String {
        let (leaf, ca) = sign_csr(csr_der);
        if self.issuer_first {
            format!("{ca}{leaf}")
        } else {
            leaf
        }
    }

    /// `(ca_url, token)` per bootstrap enrollment
    pub fn bootstrap_calls(&self) -> Vec<(String, String)> {
        self.bootstrap_calls.lock().unwrap().clone()
    }

    /// `(cert_path, key_path)` per mTLS re-enrollment
    pub fn mtls_calls(&self) -> Vec<(PathBuf, PathBuf)> {
        self.mtls_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientCertificateEnroller for RecordingEnroller {
    async fn enroll_with_bootstrap(
        &self,
        csr_der: &[u8],
        ca_url: &str,
        bootstrap_token: &str,
    ) -> Result<String, ProtocolError> {
        self.bootstrap_calls
            .lock()
            .unwrap()
            .push((ca_url.to_string(), bootstrap_token.to_string()));
        if self.fail {
            return Err(unavailable());
        }
        Ok(self.respond(csr_der))
    }

    async fn reenroll_with_mtls(
        &self,
        csr_der: &[u8],
        _ca_url: &str,
        existing_cert_path: &Path,
        existing_key_path: &Path,
    ) -> Result<String, ProtocolError> {
        // The credentials must still be the old ones while the request runs.
        assert!(existing_cert_path.exists());
        assert!(existing_key_path.exists());
        self.mtls_calls
            .lock()
            .unwrap()
            .push((existing_cert_path.to_path_buf(), existing_key_path.to_path_buf()));
        if self.fail {
            return Err(unavailable());
        }
        Ok(self.respond(csr_der))
    }
}
