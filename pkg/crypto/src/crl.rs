//! Certificate revocation list parsing

use std::collections::HashSet;
use thiserror::Error;
use x509_parser::pem::parse_x509_pem;
use x509_parser::revocation_list::CertificateRevocationList;

#[derive(Error, Debug)]
pub enum CrlError {
    #[error("Failed to decode PEM CRL: {0}")]
    Pem(String),
    #[error("Failed to parse CRL: {0}")]
    Der(String),
}

/// Hex encoding of a raw serial, lower-case with leading zeros stripped
pub(crate) fn serial_hex(raw: &[u8]) -> String {
    let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
    let trimmed = hex.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Normalize a user-supplied serial ("10:01", "0x1001", "001001") for lookup
pub fn normalize_serial(serial: &str) -> String {
    let serial = serial.trim();
    let serial = serial
        .strip_prefix("0x")
        .or_else(|| serial.strip_prefix("0X"))
        .unwrap_or(serial);

    let digits: String = serial
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Collect the serials listed in a PEM or DER encoded CRL
pub fn parse_revoked_serials(raw: &[u8]) -> Result<HashSet<String>, CrlError> {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(raw.len());
    if raw[start..].starts_with(b"-----BEGIN") {
        let (_, pem) = parse_x509_pem(raw).map_err(|e| CrlError::Pem(e.to_string()))?;
        return serials_from_der(&pem.contents);
    }

    serials_from_der(raw)
}

fn serials_from_der(der: &[u8]) -> Result<HashSet<String>, CrlError> {
    let (_, crl): (_, CertificateRevocationList) =
        x509_parser::parse_x509_crl(der).map_err(|e| CrlError::Der(e.to_string()))?;

    Ok(crl
        .iter_revoked_certificates()
        .map(|revoked| serial_hex(revoked.raw_serial()))
        .collect())
}
