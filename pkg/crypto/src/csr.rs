//! Key pair and certificate signing request generation
//!
//! Every enrollment uses a fresh EC P-256 key; the key never leaves the
//! agent except as the PEM handed to the atomic installer.

use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509Req, X509ReqBuilder};

use crate::CryptoError;

/// Freshly generated private key and the CSR signed with it
#[derive(Debug, Clone)]
pub struct KeyAndCsr {
    /// PKCS#8 PEM
    pub key_pem: String,
    pub csr_pem: String,
    pub csr_der: Vec<u8>,
}

/// Generate a key and CSR for a device certificate
///
/// `subject_dn` is either `K=V,K=V` or `/K=V/K=V`. When it carries no CN,
/// `device_name` is used as the common name.
pub fn generate_client_csr(subject_dn: &str, device_name: &str) -> Result<KeyAndCsr, CryptoError> {
    let mut entries = parse_subject_dn(subject_dn)?;
    if !entries.iter().any(|(key, _)| key.eq_ignore_ascii_case("CN")) {
        if device_name.trim().is_empty() {
            return Err(CryptoError::InvalidSubject(
                "no CN in subject and no device name".to_string(),
            ));
        }
        entries.insert(0, ("CN".to_string(), device_name.trim().to_string()));
    }

    let key = generate_key()?;
    let mut builder = request_builder(&entries, &key)?;
    sign(&mut builder, &key)?;
    finish(builder, &key)
}

/// Generate a key and CSR for a server certificate with a DNS SAN
pub fn generate_server_csr(domain: &str) -> Result<KeyAndCsr, CryptoError> {
    if domain.trim().is_empty() {
        return Err(CryptoError::InvalidSubject("empty domain name".to_string()));
    }

    let entries = vec![("CN".to_string(), domain.to_string())];
    let key = generate_key()?;
    let mut builder = request_builder(&entries, &key)?;

    let mut san_builder = SubjectAlternativeName::new();
    san_builder.dns(domain);
    let san = san_builder.build(&builder.x509v3_context(None))?;
    let mut extensions = Stack::new()?;
    extensions.push(san)?;
    builder.add_extensions(&extensions)?;

    sign(&mut builder, &key)?;
    finish(builder, &key)
}

/// Split a distinguished name into `(attribute, value)` pairs
pub fn parse_subject_dn(subject_dn: &str) -> Result<Vec<(String, String)>, CryptoError> {
    let subject_dn = subject_dn.trim();
    let parts: Vec<&str> = if let Some(slashed) = subject_dn.strip_prefix('/') {
        slashed.split('/').collect()
    } else {
        subject_dn.split(',').collect()
    };

    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| CryptoError::InvalidSubject(format!("expected K=V, got '{part}'")))?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(CryptoError::InvalidSubject(format!("empty attribute in '{part}'")));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

fn generate_key() -> Result<PKey<Private>, CryptoError> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let ec_key = EcKey::generate(&group)?;
    Ok(PKey::from_ec_key(ec_key)?)
}

fn request_builder(
    entries: &[(String, String)],
    key: &PKey<Private>,
) -> Result<X509ReqBuilder, CryptoError> {
    let mut name_builder = X509Name::builder()?;
    for (attribute, value) in entries {
        name_builder
            .append_entry_by_text(attribute, value)
            .map_err(|e| CryptoError::InvalidSubject(format!("{attribute}={value}: {e}")))?;
    }
    let name = name_builder.build();

    let mut builder = X509Req::builder()?;
    builder.set_version(0)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;
    Ok(builder)
}

fn sign(builder: &mut X509ReqBuilder, key: &PKey<Private>) -> Result<(), CryptoError> {
    builder.sign(key, MessageDigest::sha256())?;
    Ok(())
}

fn finish(builder: X509ReqBuilder, key: &PKey<Private>) -> Result<KeyAndCsr, CryptoError> {
    let csr = builder.build();
    let csr_pem = String::from_utf8(csr.to_pem()?)
        .map_err(|e| CryptoError::Cert(format!("CSR PEM is not UTF-8: {e}")))?;
    let key_pem = String::from_utf8(key.private_key_to_pem_pkcs8()?)
        .map_err(|e| CryptoError::Cert(format!("key PEM is not UTF-8: {e}")))?;

    Ok(KeyAndCsr {
        key_pem,
        csr_pem,
        csr_der: csr.to_der()?,
    })
}
