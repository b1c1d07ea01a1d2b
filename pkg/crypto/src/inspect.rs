//! Certificate inspection
//!
//! Reads an installed certificate and reports its subject, serial, validity
//! window and how much of that window has already elapsed.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use x509_parser::pem::parse_x509_pem;

use crate::crl::serial_hex;

const PEM_CERT_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_CERT_END: &str = "-----END CERTIFICATE-----";

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("Certificate not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Failed to read certificate: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse certificate: {0}")]
    Parse(String),
    #[error("Invalid validity timestamp: {0}")]
    Validity(i64),
}

/// Snapshot of an installed certificate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    /// Lower-case hex, leading zeros stripped
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub expiry_date: DateTime<Utc>,
    /// Share of the validity window already elapsed, 0-100
    pub lifetime_percentage: f64,
}

/// Inspect the certificate stored at `path`
///
/// Returns [`InspectError::NotFound`] when the file does not exist so callers
/// can tell "never enrolled" apart from "unreadable".
pub fn get_certificate_info(path: impl AsRef<Path>) -> Result<CertificateInfo, InspectError> {
    let path = path.as_ref();
    let pem = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(InspectError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    inspect_pem(&pem, Utc::now())
}

/// Inspect the first certificate of a PEM buffer as of `now`
pub fn inspect_pem(pem: &[u8], now: DateTime<Utc>) -> Result<CertificateInfo, InspectError> {
    let (_, pem) =
        parse_x509_pem(pem).map_err(|e| InspectError::Parse(format!("invalid PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| InspectError::Parse(format!("invalid X.509: {e}")))?;

    let not_before = to_utc(cert.validity().not_before.timestamp())?;
    let expiry_date = to_utc(cert.validity().not_after.timestamp())?;

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial: serial_hex(cert.raw_serial()),
        not_before,
        expiry_date,
        lifetime_percentage: lifetime_percentage(not_before, expiry_date, now),
    })
}

/// Percentage of the validity window elapsed at `now`, clamped to 0-100
///
/// A degenerate window (not_after <= not_before) counts as fully elapsed.
pub fn lifetime_percentage(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let total = (not_after - not_before).num_seconds();
    if total <= 0 {
        return 100.0;
    }

    let elapsed = (now - not_before).num_seconds();
    #[allow(clippy::cast_precision_loss)]
    let pct = elapsed as f64 / total as f64 * 100.0;
    pct.clamp(0.0, 100.0)
}

/// Every certificate block of a PEM bundle, in order
pub fn pem_certificates(bundle: &str) -> Vec<String> {
    bundle
        .split_inclusive(PEM_CERT_END)
        .filter_map(|block| block.find(PEM_CERT_BEGIN).map(|start| &block[start..]))
        .filter(|block| block.ends_with(PEM_CERT_END))
        .map(|block| format!("{block}\n"))
        .collect()
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>, InspectError> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or(InspectError::Validity(timestamp))
}
