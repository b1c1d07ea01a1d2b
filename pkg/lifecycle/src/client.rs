//! Client certificate lifecycle (EST)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use warden_config::ClientAgentConfig;
use warden_crypto::{generate_client_csr, inspect_pem, leaf_for_key};
use warden_workflow::{Step, StepError, StepName, Workflow, WorkflowContext};

use crate::artifacts::install_issued;
use crate::decision::{Action, AgentKind, AuthMode, DecideStep};
use crate::executor::ClientCertificateEnroller;
use crate::monitor::MonitorStep;
use crate::revocation::RevocationValidator;
use crate::validate::ValidateStep;
use crate::LifecycleState;

pub type ClientContext = WorkflowContext<ClientAgentConfig, LifecycleState>;

pub struct ClientExecuteStep {
    enroller: Arc<dyn ClientCertificateEnroller>,
}

impl ClientExecuteStep {
    pub fn new(enroller: Arc<dyn ClientCertificateEnroller>) -> Self {
        Self { enroller }
    }
}

#[async_trait]
impl Step<ClientAgentConfig, LifecycleState> for ClientExecuteStep {
    async fn run(&self, ctx: &mut ClientContext) -> Result<Value, StepError> {
        let decision = ctx
            .state
            .data
            .last_decision
            .clone()
            .ok_or_else(|| StepError::new("no decision recorded for this iteration"))?;

        if decision.action == Action::Skip {
            debug!(reason = %decision.reason, "Nothing to execute");
            return Ok(json!({ "action": decision.action }));
        }

        let config = ctx.shared_config();
        let target = &config.target;
        let request = generate_client_csr(&config.subject_dn, &config.device_name)
            .map_err(|e| StepError::wrap("CSR generation failed", e))?;

        info!(
            device = %config.device_name,
            action = %decision.action,
            auth_mode = %decision.auth_mode,
            "Requesting client certificate"
        );

        let issued = match decision.auth_mode {
            AuthMode::Bootstrap => {
                let token = config.est.bootstrap_token().ok_or_else(|| {
                    StepError::new("bootstrap enrollment requires a bootstrap token")
                })?;
                self.enroller
                    .enroll_with_bootstrap(&request.csr_der, &target.pki_url, &token)
                    .await
            }
            AuthMode::Mtls => {
                self.enroller
                    .reenroll_with_mtls(
                        &request.csr_der,
                        &target.pki_url,
                        &target.cert_path,
                        &target.key_path,
                    )
                    .await
            }
        }
        .map_err(|e| StepError::wrap("client certificate request failed", e))?;

        let (leaf, chain) = leaf_for_key(&issued, &request.key_pem)
            .map_err(|e| StepError::wrap("CA response is unreadable", e))?
            .ok_or_else(|| {
                StepError::new("CA response holds no certificate for the requested key")
            })?;
        let info = inspect_pem(leaf.as_bytes(), chrono::Utc::now())
            .map_err(|e| StepError::wrap("issued certificate is unreadable", e))?;

        install_issued(target, &leaf, &request.key_pem, chain.as_deref(), None)
            .map_err(|e| StepError::wrap("certificate install failed", e))?;

        info!(
            device = %config.device_name,
            subject = %info.subject,
            not_after = %info.expiry_date,
            "Client certificate installed"
        );

        Ok(json!({
            "action": decision.action,
            "auth_mode": decision.auth_mode,
            "subject": info.subject,
            "not_after": info.expiry_date,
        }))
    }
}

/// Monitor, Decide, Execute and Validate for the device certificate
pub fn client_workflow(
    enroller: Arc<dyn ClientCertificateEnroller>,
    revocation: RevocationValidator,
) -> Workflow<ClientAgentConfig, LifecycleState> {
    let mut workflow = Workflow::new(AgentKind::Client.as_str());
    workflow.register(StepName::Monitor, MonitorStep::new(revocation), false);
    workflow.register(StepName::Decide, DecideStep::new(AgentKind::Client), false);
    workflow.register(StepName::Execute, ClientExecuteStep::new(enroller), true);
    workflow.register(StepName::Validate, ValidateStep, true);
    workflow
}
