//! Certificate lifecycle agents
//!
//! Each agent drives one managed certificate through Monitor, Decide,
//! Execute and Validate on a [`warden_workflow::Workflow`]. The server agent
//! obtains its certificate over ACME and reloads the web server afterwards;
//! the client agent enrolls over EST with a bootstrap token and re-enrolls
//! over mutual TLS.

pub mod acme;
pub mod artifacts;
pub mod client;
pub mod decision;
pub mod est;
pub mod executor;
pub mod monitor;
pub mod reload;
pub mod revocation;
pub mod server;
pub mod status;
pub mod validate;

#[cfg(test)]
mod fakes;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;
use warden_config::{CertificateTarget, ClientAgentConfig, ServerAgentConfig};
use warden_workflow::{MetricsHandle, StepName, Workflow, WorkflowContext};

pub use acme::AcmeIssuer;
pub use client::{client_workflow, ClientContext, ClientExecuteStep};
pub use decision::{decide, Action, AgentKind, AuthMode, Decision, DecideStep};
pub use est::{decode_enrollment_response, EstEnroller};
pub use executor::{
    ClientCertificateEnroller, ProtocolError, ServerCertificate, ServerCertificateIssuer,
};
pub use monitor::MonitorStep;
pub use reload::{ReloadController, ReloadFailure, ReloadOutcome};
pub use revocation::{RevocationError, RevocationValidator};
pub use server::{server_workflow, ServerContext, ServerExecuteStep};
pub use status::CertificateStatus;
pub use validate::ValidateStep;

/// Order every lifecycle iteration runs its steps in
pub const LIFECYCLE_STEPS: [StepName; 4] = StepName::ALL;

const CRL_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-agent data carried between steps of one iteration
#[derive(Debug, Clone, Default)]
pub struct LifecycleState {
    pub certificate_status: Option<CertificateStatus>,
    pub last_decision: Option<Decision>,
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Revocation setup failed: {0}")]
    Revocation(#[from] RevocationError),
    #[error("Protocol setup failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A lifecycle workflow bound to its own context
pub struct LifecycleAgent<C> {
    workflow: Workflow<C, LifecycleState>,
    context: WorkflowContext<C, LifecycleState>,
}

impl<C> LifecycleAgent<C>
where
    C: AsRef<CertificateTarget> + Send + Sync + 'static,
{
    pub fn new(workflow: Workflow<C, LifecycleState>, config: C) -> Self {
        Self {
            workflow,
            context: WorkflowContext::new(config, LifecycleState::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.workflow.name()
    }

    pub fn metrics_handle(&self) -> MetricsHandle {
        self.workflow.metrics_handle()
    }

    pub fn context(&self) -> &WorkflowContext<C, LifecycleState> {
        &self.context
    }

    /// Run until `max_iterations` passes complete (`0` for no limit) or
    /// `shutdown` turns true, then hand back the final context
    pub async fn run(
        mut self,
        max_iterations: u64,
        shutdown: watch::Receiver<bool>,
    ) -> WorkflowContext<C, LifecycleState> {
        let target: &CertificateTarget = self.context.config().as_ref();
        let interval = Duration::from_secs(target.check_interval_seconds);
        info!(
            agent = %self.workflow.name(),
            cert_path = %target.cert_path.display(),
            check_interval_secs = interval.as_secs(),
            "Starting lifecycle agent"
        );

        self.workflow
            .run_loop_until(
                &mut self.context,
                &LIFECYCLE_STEPS,
                max_iterations,
                interval,
                shutdown,
            )
            .await;
        self.context
    }
}

/// Server agent backed by ACME
pub fn server_agent(
    config: ServerAgentConfig,
) -> Result<LifecycleAgent<ServerAgentConfig>, LifecycleError> {
    let issuer = AcmeIssuer::new(&config.acme);
    let workflow = server_workflow(Arc::new(issuer), RevocationValidator::new(CRL_FETCH_TIMEOUT)?);
    Ok(LifecycleAgent::new(workflow, config))
}

/// Client agent backed by EST
pub fn client_agent(
    config: ClientAgentConfig,
) -> Result<LifecycleAgent<ClientAgentConfig>, LifecycleError> {
    let enroller = EstEnroller::new(&config.est)?;
    let workflow = client_workflow(Arc::new(enroller), RevocationValidator::new(CRL_FETCH_TIMEOUT)?);
    Ok(LifecycleAgent::new(workflow, config))
}
