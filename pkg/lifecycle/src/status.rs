use chrono::{DateTime, Utc};
use serde::Serialize;
use warden_crypto::CertificateInfo;

/// What Monitor observed about the managed certificate this iteration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateStatus {
    pub exists: bool,
    /// False when the file exists but does not parse as a certificate
    pub readable: bool,
    pub expiry_date: Option<DateTime<Utc>>,
    pub lifetime_percentage: Option<f64>,
    pub revoked: bool,
    pub renewal_required: bool,
    pub subject: Option<String>,
    pub serial: Option<String>,
}

impl CertificateStatus {
    /// No certificate installed yet
    pub fn missing() -> Self {
        Self {
            exists: false,
            readable: false,
            expiry_date: None,
            lifetime_percentage: None,
            revoked: false,
            renewal_required: true,
            subject: None,
            serial: None,
        }
    }

    /// A file is present at the certificate path but cannot be parsed
    pub fn unreadable() -> Self {
        Self {
            exists: true,
            readable: false,
            expiry_date: None,
            lifetime_percentage: None,
            revoked: false,
            renewal_required: true,
            subject: None,
            serial: None,
        }
    }

    /// Status of an installed certificate
    pub fn from_inspection(info: &CertificateInfo, revoked: bool, threshold_pct: u8) -> Self {
        Self {
            exists: true,
            readable: true,
            expiry_date: Some(info.expiry_date),
            lifetime_percentage: Some(info.lifetime_percentage),
            revoked,
            renewal_required: renewal_required(
                true,
                revoked,
                Some(info.lifetime_percentage),
                threshold_pct,
            ),
            subject: Some(info.subject.clone()),
            serial: Some(info.serial.clone()),
        }
    }

    /// Status built from bare observations, without a certificate on disk
    pub fn new(exists: bool, revoked: bool, lifetime_percentage: Option<f64>, threshold_pct: u8) -> Self {
        if !exists {
            return Self::missing();
        }
        Self {
            exists,
            readable: true,
            expiry_date: None,
            lifetime_percentage,
            revoked,
            renewal_required: renewal_required(exists, revoked, lifetime_percentage, threshold_pct),
            subject: None,
            serial: None,
        }
    }
}

/// `!exists || revoked || lifetime >= threshold`
///
/// An existing certificate with unknown lifetime counts as fully elapsed.
pub fn renewal_required(
    exists: bool,
    revoked: bool,
    lifetime_percentage: Option<f64>,
    threshold_pct: u8,
) -> bool {
    !exists || revoked || lifetime_percentage.unwrap_or(100.0) >= f64::from(threshold_pct)
}
