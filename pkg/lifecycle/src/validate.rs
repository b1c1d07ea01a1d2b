//! Validate step: confirm the managed files are usable after Execute

use async_trait::async_trait;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use tracing::debug;
use warden_config::CertificateTarget;
use warden_crypto::{get_certificate_info, key_matches_certificate};
use warden_workflow::{Step, StepError, WorkflowContext};

use crate::LifecycleState;

pub struct ValidateStep;

fn require_file(kind: &str, path: &Path) -> Result<u64, StepError> {
    match fs::metadata(path) {
        Ok(meta) if !meta.is_file() => Err(StepError::new(format!(
            "{kind} path is not a regular file: {}",
            path.display()
        ))),
        Ok(meta) if meta.len() == 0 => Err(StepError::new(format!(
            "{kind} file is empty: {}",
            path.display()
        ))),
        Ok(meta) => Ok(meta.len()),
        Err(e) => Err(StepError::new(format!(
            "{kind} file missing after install: {} ({e})",
            path.display()
        ))),
    }
}

#[async_trait]
impl<C> Step<C, LifecycleState> for ValidateStep
where
    C: AsRef<CertificateTarget> + Send + Sync,
{
    async fn run(&self, ctx: &mut WorkflowContext<C, LifecycleState>) -> Result<Value, StepError> {
        let target: &CertificateTarget = ctx.config().as_ref();

        require_file("certificate", &target.cert_path)?;
        require_file("key", &target.key_path)?;
        let info = get_certificate_info(&target.cert_path)
            .map_err(|e| StepError::wrap("installed certificate is unreadable", e))?;

        let read = |path: &Path| {
            fs::read_to_string(path)
                .map_err(|e| StepError::wrap(&format!("failed to read {}", path.display()), e))
        };
        let matches = key_matches_certificate(&read(&target.cert_path)?, &read(&target.key_path)?)
            .map_err(|e| StepError::wrap("installed key is unreadable", e))?;
        if !matches {
            return Err(StepError::new(format!(
                "installed key {} does not belong to certificate {}",
                target.key_path.display(),
                target.cert_path.display()
            )));
        }

        debug!(
            cert_path = %target.cert_path.display(),
            expiry = %info.expiry_date,
            "Installed certificate validated"
        );
        Ok(json!({
            "cert_path": target.cert_path,
            "key_path": target.key_path,
            "subject": info.subject,
            "expiry_date": info.expiry_date,
        }))
    }
}
