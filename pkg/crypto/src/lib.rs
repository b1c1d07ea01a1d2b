//! Certificate primitives for the Warden agents
//!
//! Inspection of installed certificates, atomic installation of
//! certificate/key pairs, CRL parsing and key/CSR generation.

pub mod crl;
pub mod csr;
pub mod inspect;
pub mod install;
pub mod pair;
pub mod testing;

use thiserror::Error;

pub use crl::{normalize_serial, parse_revoked_serials, CrlError};
pub use csr::{generate_client_csr, generate_server_csr, KeyAndCsr};
pub use inspect::{
    get_certificate_info, inspect_pem, lifetime_percentage, pem_certificates, CertificateInfo,
    InspectError,
};
pub use install::{
    install_pair, set_permissions, temp_path, write_atomic, InstallError, CERT_MODE, KEY_MODE,
};
pub use pair::{key_matches_certificate, leaf_for_key};

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
    #[error("Invalid subject: {0}")]
    InvalidSubject(String),
    #[error("Certificate error: {0}")]
    Cert(String),
}
