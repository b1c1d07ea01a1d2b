//! Certificate fixtures shared by the Warden crates' tests

use chrono::{DateTime, Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::{X509Name, X509};

use crate::CryptoError;

/// CRL issued by "Warden Test CA" revoking serials 0x1001 and 0x2A2B
pub const REVOKED_CRL_PEM: &[u8] = include_bytes!("../tests/fixtures/revoked.crl.pem");
/// DER encoding of [`REVOKED_CRL_PEM`]
pub const REVOKED_CRL_DER: &[u8] = include_bytes!("../tests/fixtures/revoked.crl.der");
/// Serials listed in the fixture CRL, normalized
pub const REVOKED_SERIALS: [&str; 2] = ["1001", "2a2b"];

#[derive(Debug, Clone)]
pub struct TestCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Issue a self-signed certificate with an explicit validity window
pub fn issue_test_certificate(
    common_name: &str,
    serial: u32,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<TestCertificate, CryptoError> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = PKey::from_ec_key(EcKey::generate(&group)?)?;

    let mut name = X509Name::builder()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(serial)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::from_unix(not_before.timestamp())?;
    let not_after = Asn1Time::from_unix(not_after.timestamp())?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    let cert_pem = String::from_utf8(cert.to_pem()?)
        .map_err(|e| CryptoError::Cert(format!("certificate PEM is not UTF-8: {e}")))?;
    let key_pem = String::from_utf8(key.private_key_to_pem_pkcs8()?)
        .map_err(|e| CryptoError::Cert(format!("key PEM is not UTF-8: {e}")))?;

    Ok(TestCertificate { cert_pem, key_pem })
}

/// Issue a certificate whose validity window is `elapsed_pct` percent used
pub fn issue_aged_certificate(
    common_name: &str,
    serial: u32,
    elapsed_pct: f64,
    total_days: i64,
) -> Result<TestCertificate, CryptoError> {
    let total = Duration::days(total_days);
    #[allow(clippy::cast_possible_truncation)]
    let elapsed = Duration::seconds((total.num_seconds() as f64 * elapsed_pct / 100.0) as i64);
    let not_before = Utc::now() - elapsed;

    issue_test_certificate(common_name, serial, not_before, not_before + total)
}
