//! Server certificate lifecycle (ACME)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use warden_config::ServerAgentConfig;
use warden_workflow::{Step, StepError, StepName, Workflow, WorkflowContext};

use crate::artifacts::install_issued;
use crate::decision::{Action, AgentKind, DecideStep};
use crate::executor::ServerCertificateIssuer;
use crate::monitor::MonitorStep;
use crate::reload::ReloadController;
use crate::revocation::RevocationValidator;
use crate::validate::ValidateStep;
use crate::LifecycleState;

pub type ServerContext = WorkflowContext<ServerAgentConfig, LifecycleState>;

pub struct ServerExecuteStep {
    issuer: Arc<dyn ServerCertificateIssuer>,
}

impl ServerExecuteStep {
    pub fn new(issuer: Arc<dyn ServerCertificateIssuer>) -> Self {
        Self { issuer }
    }
}

#[async_trait]
impl Step<ServerAgentConfig, LifecycleState> for ServerExecuteStep {
    async fn run(&self, ctx: &mut ServerContext) -> Result<Value, StepError> {
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
        let force_renew = decision.action != Action::Enroll;
        info!(
            domain = %config.domain_name,
            action = %decision.action,
            force_renew,
            "Requesting server certificate"
        );

        let issued = self
            .issuer
            .request_server_certificate(&config.domain_name, &config.target.pki_url, force_renew)
            .await
            .map_err(|e| StepError::wrap("server certificate request failed", e))?;

        install_issued(
            &config.target,
            &issued.cert_pem,
            &issued.key_pem,
            issued.chain_pem.as_deref(),
            issued.fullchain_pem.as_deref(),
        )
        .map_err(|e| StepError::wrap("certificate install failed", e))?;

        info!(
            domain = %config.domain_name,
            subject = %issued.subject,
            not_after = %issued.not_after,
            "Server certificate installed"
        );

        let reloaded = match &config.reload {
            Some(reload) => Some(
                ReloadController::from_config(reload)
                    .reload(&reload.target, reload.timeout_seconds)
                    .await,
            ),
            None => None,
        };

        Ok(json!({
            "action": decision.action,
            "subject": issued.subject,
            "not_after": issued.not_after,
            "reloaded": reloaded,
        }))
    }
}

/// Monitor, Decide, Execute and Validate for the server certificate
///
/// Execute and Validate continue on error so their failures are reported
/// as unsuccessful results; the next iteration retries.
pub fn server_workflow(
    issuer: Arc<dyn ServerCertificateIssuer>,
    revocation: RevocationValidator,
) -> Workflow<ServerAgentConfig, LifecycleState> {
    let mut workflow = Workflow::new(AgentKind::Server.as_str());
    workflow.register(StepName::Monitor, MonitorStep::new(revocation), false);
    workflow.register(StepName::Decide, DecideStep::new(AgentKind::Server), false);
    workflow.register(StepName::Execute, ServerExecuteStep::new(issuer), true);
    workflow.register(StepName::Validate, ValidateStep, true);
    workflow
}
