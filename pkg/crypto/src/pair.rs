//! Matching certificates to private keys

use openssl::pkey::PKey;
use openssl::x509::X509;

use crate::inspect::pem_certificates;
use crate::CryptoError;

fn key_public_der(key_pem: &str) -> Result<Vec<u8>, CryptoError> {
    let key = PKey::private_key_from_pem(key_pem.as_bytes())?;
    Ok(key.public_key_to_der()?)
}

fn cert_public_der(cert_pem: &str) -> Result<Vec<u8>, CryptoError> {
    let cert = X509::from_pem(cert_pem.as_bytes())?;
    Ok(cert.public_key()?.public_key_to_der()?)
}

/// True when `cert_pem` carries the public half of `key_pem`
pub fn key_matches_certificate(cert_pem: &str, key_pem: &str) -> Result<bool, CryptoError> {
    Ok(cert_public_der(cert_pem)? == key_public_der(key_pem)?)
}

/// Split a CA response into the certificate for `key_pem` and the rest
///
/// The CA may return the bundle in any order; the leaf is the one block
/// whose public key matches. Returns `None` when no block matches.
pub fn leaf_for_key(
    bundle: &str,
    key_pem: &str,
) -> Result<Option<(String, Option<String>)>, CryptoError> {
    let wanted = key_public_der(key_pem)?;
    let mut blocks = pem_certificates(bundle);

    let mut leaf_index = None;
    for (index, block) in blocks.iter().enumerate() {
        if cert_public_der(block)? == wanted {
            leaf_index = Some(index);
            break;
        }
    }
    let Some(index) = leaf_index else {
        return Ok(None);
    };

    let leaf = blocks.remove(index);
    let chain: String = blocks.concat();
    Ok(Some((leaf, (!chain.is_empty()).then_some(chain))))
}
