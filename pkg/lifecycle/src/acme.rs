//! ACME issuer for server certificates (HTTP-01 over a webroot)

use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_config::AcmeConfig;
use warden_crypto::{
    generate_server_csr, inspect_pem, leaf_for_key, write_atomic, CERT_MODE, KEY_MODE,
};

use crate::executor::{ProtocolError, ServerCertificate, ServerCertificateIssuer};

const CHALLENGE_SUBDIR: &str = ".well-known/acme-challenge";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 90;

fn acme_err(context: &str) -> impl Fn(instant_acme::Error) -> ProtocolError + '_ {
    move |e| ProtocolError::Acme(format!("{context}: {e}"))
}

/// Obtains server certificates from an ACME directory
///
/// Challenges are answered by writing the key authorization below
/// `challenge_dir`, which the web server publishes as its webroot.
pub struct AcmeIssuer {
    challenge_dir: PathBuf,
    account_path: Option<PathBuf>,
    contact: Vec<String>,
    poll_interval: Duration,
    max_polls: u32,
}

impl AcmeIssuer {
    pub fn new(config: &AcmeConfig) -> Self {
        Self {
            challenge_dir: config.challenge_dir.clone(),
            account_path: config.account_path.clone(),
            contact: config.contact.clone(),
            poll_interval: POLL_INTERVAL,
            max_polls: MAX_POLLS,
        }
    }

    /// File the web server must serve for `token`
    pub fn challenge_path(&self, token: &str) -> PathBuf {
        self.challenge_dir.join(CHALLENGE_SUBDIR).join(token)
    }

    async fn account(&self, directory_url: &str) -> Result<Account, ProtocolError> {
        if let Some(path) = &self.account_path {
            match fs::read_to_string(path) {
                Ok(raw) => {
                    let credentials: AccountCredentials = serde_json::from_str(&raw)
                        .map_err(|e| {
                            ProtocolError::Acme(format!(
                                "unreadable account credentials at {}: {e}",
                                path.display()
                            ))
                        })?;
                    debug!(account_path = %path.display(), "Restoring ACME account");
                    return Account::from_credentials(credentials)
                        .await
                        .map_err(acme_err("failed to restore account"));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let contact: Vec<&str> = self.contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await
        .map_err(acme_err("failed to create account"))?;
        info!(directory = directory_url, "Created ACME account");

        if let Some(path) = &self.account_path {
            let raw = serde_json::to_vec(&credentials)
                .map_err(|e| ProtocolError::Acme(format!("failed to encode credentials: {e}")))?;
            write_atomic(path, &raw, KEY_MODE).map_err(|e| {
                ProtocolError::Acme(format!("failed to persist account credentials: {e}"))
            })?;
        }
        Ok(account)
    }

    async fn order(
        &self,
        domain: &str,
        directory_url: &str,
        published: &mut Vec<PathBuf>,
    ) -> Result<ServerCertificate, ProtocolError> {
        let account = self.account(directory_url).await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(acme_err("failed to create order"))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(acme_err("failed to fetch authorizations"))?;
        for authorization in &authorizations {
            if authorization.status == AuthorizationStatus::Valid {
                continue;
            }
            let challenge = authorization
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    ProtocolError::Acme(format!("no http-01 challenge offered for {domain}"))
                })?;

            let path = self.challenge_path(&challenge.token);
            let key_authorization = order.key_authorization(challenge);
            write_atomic(&path, key_authorization.as_str().as_bytes(), CERT_MODE).map_err(|e| {
                ProtocolError::Acme(format!("failed to publish challenge: {e}"))
            })?;
            published.push(path);

            debug!(domain, token = %challenge.token, "Challenge published");
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(acme_err("failed to mark challenge ready"))?;
        }

        let mut polls = 0;
        loop {
            order.refresh().await.map_err(acme_err("failed to refresh order"))?;
            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(ProtocolError::Acme(format!(
                        "order for {domain} became invalid: {:?}",
                        state.error
                    )))
                }
                OrderStatus::Pending | OrderStatus::Processing => {}
            }
            polls += 1;
            if polls >= self.max_polls {
                return Err(ProtocolError::Acme(format!(
                    "order for {domain} not ready after {polls} polls"
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        require_ready(domain, &order.state().status)?;
        let request = generate_server_csr(domain)?;
        order
            .finalize(&request.csr_der)
            .await
            .map_err(acme_err("failed to finalize order"))?;

        let mut polls = 0;
        let bundle = loop {
            if let Some(bundle) = order
                .certificate()
                .await
                .map_err(acme_err("failed to download certificate"))?
            {
                break bundle;
            }
            polls += 1;
            if polls >= self.max_polls {
                return Err(ProtocolError::Acme(format!(
                    "certificate for {domain} not issued after {polls} polls"
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        let (leaf, chain) = leaf_for_key(&bundle, &request.key_pem)?.ok_or_else(|| {
            ProtocolError::InvalidResponse(format!(
                "certificate download for {domain} holds no certificate for the new key"
            ))
        })?;
        let info = inspect_pem(leaf.as_bytes(), Utc::now())
            .map_err(|e| ProtocolError::InvalidResponse(e.to_string()))?;

        Ok(ServerCertificate {
            subject: info.subject,
            not_after: info.expiry_date,
            fullchain_pem: Some(bundle),
            chain_pem: chain,
            cert_pem: leaf,
            key_pem: request.key_pem,
        })
    }
}

/// Only a Ready order is finalized with the fresh key
///
/// A Valid order was finalized earlier with a key this agent no longer has.
fn require_ready(domain: &str, status: &OrderStatus) -> Result<(), ProtocolError> {
    match status {
        OrderStatus::Ready => Ok(()),
        OrderStatus::Valid => Err(ProtocolError::Acme(format!(
            "order for {domain} is already valid; its certificate would not match the new key"
        ))),
        other => Err(ProtocolError::Acme(format!(
            "order for {domain} cannot be finalized in state {other:?}"
        ))),
    }
}

fn remove_challenges(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove challenge file");
        }
    }
}

#[async_trait]
impl ServerCertificateIssuer for AcmeIssuer {
    async fn request_server_certificate(
        &self,
        domain: &str,
        ca_url: &str,
        force_renew: bool,
    ) -> Result<ServerCertificate, ProtocolError> {
        info!(domain, directory = ca_url, force_renew, "Starting ACME order");

        let mut published = Vec::new();
        let result = self.order(domain, ca_url, &mut published).await;
        remove_challenges(&published);

        if let Ok(issued) = &result {
            info!(domain, not_after = %issued.not_after, "ACME order completed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn has_pending_challenges(challenge_dir: &std::path::Path) -> bool {
        fs::read_dir(challenge_dir.join(CHALLENGE_SUBDIR))
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    fn config(dir: &TempDir) -> AcmeConfig {
        AcmeConfig {
            challenge_dir: dir.path().join("webroot"),
            account_path: Some(dir.path().join("acme").join("account.json")),
            contact: vec!["mailto:ops@example.com".to_string()],
        }
    }

    #[test]
    fn test_challenge_path_is_under_well_known() {
        let dir = TempDir::new().unwrap();
        let issuer = AcmeIssuer::new(&config(&dir));

        assert_eq!(
            issuer.challenge_path("tok-123"),
            dir.path().join("webroot/.well-known/acme-challenge/tok-123")
        );
    }

    #[test]
    fn test_only_ready_orders_are_finalized() {
        assert!(require_ready("edge.example.com", &OrderStatus::Ready).is_ok());

        let err = require_ready("edge.example.com", &OrderStatus::Valid).unwrap_err();
        assert!(matches!(err, ProtocolError::Acme(_)));
        assert!(err.to_string().contains("already valid"), "{err}");

        assert!(require_ready("edge.example.com", &OrderStatus::Pending).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_directory_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let issuer = AcmeIssuer::new(&config);

        let err = issuer
            .request_server_certificate("edge.example.com", "http://127.0.0.1:1/directory", false)
            .await
            .unwrap_err();

        assert!(matches!(err, ProtocolError::Acme(_)), "{err}");
        assert!(!has_pending_challenges(&config.challenge_dir));
        assert!(!config.account_path.unwrap().exists());
    }

    #[tokio::test]
    async fn test_corrupt_account_credentials_are_reported() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let account_path = config.account_path.clone().unwrap();
        fs::create_dir_all(account_path.parent().unwrap()).unwrap();
        fs::write(&account_path, "not json").unwrap();
        let issuer = AcmeIssuer::new(&config);

        let err = issuer
            .request_server_certificate("edge.example.com", "http://127.0.0.1:1/directory", true)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("unreadable account credentials"));
        assert_eq!(fs::read_to_string(&account_path).unwrap(), "not json");
    }
}
