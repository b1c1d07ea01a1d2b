//! Monitor step: observe the installed certificate

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};
use warden_config::CertificateTarget;
use warden_crypto::{get_certificate_info, InspectError};
use warden_workflow::{Step, StepError, WorkflowContext};

use crate::revocation::RevocationValidator;
use crate::status::CertificateStatus;
use crate::LifecycleState;

pub struct MonitorStep {
    revocation: RevocationValidator,
}

impl MonitorStep {
    pub fn new(revocation: RevocationValidator) -> Self {
        Self { revocation }
    }

    async fn check_revocation(&self, target: &CertificateTarget, serial: &str) -> bool {
        let crl = &target.crl;
        if !crl.enabled {
            return false;
        }
        let (Some(url), Some(cache_path)) = (crl.url.as_deref(), crl.cache_path.as_deref()) else {
            warn!("CRL checking enabled without url or cache_path, skipping");
            return false;
        };

        self.revocation
            .refresh_cache(url, cache_path, crl.max_age_hours)
            .await;
        self.revocation.is_revoked(serial, cache_path)
    }
}

#[async_trait]
impl<C> Step<C, LifecycleState> for MonitorStep
where
    C: AsRef<CertificateTarget> + Send + Sync,
{
    async fn run(&self, ctx: &mut WorkflowContext<C, LifecycleState>) -> Result<Value, StepError> {
        let config = ctx.shared_config();
        let target: &CertificateTarget = (*config).as_ref();
        ctx.state.data.last_decision = None;

        let status = match get_certificate_info(&target.cert_path) {
            Ok(info) => {
                let revoked = self.check_revocation(target, &info.serial).await;
                if revoked {
                    warn!(serial = %info.serial, subject = %info.subject, "Certificate is revoked");
                }
                CertificateStatus::from_inspection(&info, revoked, target.renewal_threshold_pct)
            }
            Err(InspectError::NotFound(path)) => {
                debug!(cert_path = %path.display(), "No certificate installed");
                CertificateStatus::missing()
            }
            Err(e @ (InspectError::Parse(_) | InspectError::Validity(_))) => {
                warn!(
                    cert_path = %target.cert_path.display(),
                    error = %e,
                    "Installed certificate is unreadable, replacing it"
                );
                CertificateStatus::unreadable()
            }
            Err(e) => return Err(StepError::wrap("certificate inspection failed", e)),
        };

        info!(
            cert_path = %target.cert_path.display(),
            exists = status.exists,
            readable = status.readable,
            lifetime_pct = status.lifetime_percentage.unwrap_or_default(),
            revoked = status.revoked,
            renewal_required = status.renewal_required,
            "Certificate status"
        );

        let output = serde_json::to_value(&status)
            .map_err(|e| StepError::wrap("failed to serialize certificate status", e))?;
        ctx.state.data.certificate_status = Some(status);
        Ok(output)
    }
}
