use std::path::PathBuf;
use tracing::info;
use warden_config::CertificateTarget;
use warden_crypto::{install_pair, write_atomic, InstallError, CERT_MODE};

/// Install issued material into the paths `target` owns
///
/// The certificate/key pair goes first; chain outputs are only written when
/// configured. A missing full chain is assembled from the leaf and chain.
pub fn install_issued(
    target: &CertificateTarget,
    cert_pem: &str,
    key_pem: &str,
    chain_pem: Option<&str>,
    fullchain_pem: Option<&str>,
) -> Result<Vec<PathBuf>, InstallError> {
    install_pair(&target.cert_path, &target.key_path, cert_pem, key_pem)?;
    let mut written = vec![target.cert_path.clone(), target.key_path.clone()];

    if let (Some(path), Some(chain)) = (&target.chain_path, chain_pem) {
        write_atomic(path, chain.as_bytes(), CERT_MODE)?;
        written.push(path.clone());
    }

    if let Some(path) = &target.fullchain_path {
        let fullchain = fullchain_pem.map_or_else(
            || format!("{cert_pem}{}", chain_pem.unwrap_or_default()),
            ToString::to_string,
        );
        write_atomic(path, fullchain.as_bytes(), CERT_MODE)?;
        written.push(path.clone());
    }

    info!(
        cert_path = %target.cert_path.display(),
        files = written.len(),
        "Installed issued certificate"
    );
    Ok(written)
}
