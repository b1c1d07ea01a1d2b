//! Decide step: choose what to do about the observed certificate

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::info;
use warden_config::CertificateTarget;
use warden_workflow::{Step, StepError, WorkflowContext};

use crate::status::CertificateStatus;
use crate::LifecycleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Enroll,
    Renew,
    Reenroll,
    Skip,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Enroll => "enroll",
            Action::Renew => "renew",
            Action::Reenroll => "reenroll",
            Action::Skip => "skip",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the next request to the CA authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Pre-shared bootstrap token
    Bootstrap,
    /// Mutual TLS with the certificate being replaced
    Mtls,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Bootstrap => f.write_str("bootstrap"),
            AuthMode::Mtls => f.write_str("mtls"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Server,
    Client,
}

impl AgentKind {
    /// Action used to replace an existing certificate
    pub fn renewal_action(&self) -> Action {
        match self {
            AgentKind::Server => Action::Renew,
            AgentKind::Client => Action::Reenroll,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Server => "server",
            AgentKind::Client => "client",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    pub auth_mode: AuthMode,
}

/// Pure decision over a certificate status
///
/// An absent, unreadable or revoked certificate can never authenticate
/// its own replacement, so all three fall back to bootstrap auth.
pub fn decide(status: &CertificateStatus, kind: AgentKind, threshold_pct: u8) -> Decision {
    if !status.exists {
        return Decision {
            action: Action::Enroll,
            reason: "certificate not found".to_string(),
            auth_mode: AuthMode::Bootstrap,
        };
    }

    if !status.readable {
        return Decision {
            action: kind.renewal_action(),
            reason: "certificate unreadable".to_string(),
            auth_mode: AuthMode::Bootstrap,
        };
    }

    let lifetime = status
        .lifetime_percentage
        .map_or_else(|| "unknown".to_string(), |pct| format!("{pct:.1}%"));

    if status.revoked {
        return Decision {
            action: kind.renewal_action(),
            reason: format!("certificate revoked (lifetime {lifetime})"),
            auth_mode: AuthMode::Bootstrap,
        };
    }

    if status.renewal_required {
        return Decision {
            action: kind.renewal_action(),
            reason: format!("lifetime {lifetime} reached threshold {threshold_pct}%"),
            auth_mode: AuthMode::Mtls,
        };
    }

    Decision {
        action: Action::Skip,
        reason: format!("lifetime {lifetime} below threshold {threshold_pct}%"),
        auth_mode: AuthMode::Mtls,
    }
}

pub struct DecideStep {
    kind: AgentKind,
}

impl DecideStep {
    pub fn new(kind: AgentKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl<C> Step<C, LifecycleState> for DecideStep
where
    C: AsRef<CertificateTarget> + Send + Sync,
{
    async fn run(&self, ctx: &mut WorkflowContext<C, LifecycleState>) -> Result<Value, StepError> {
        let status = ctx
            .state
            .data
            .certificate_status
            .as_ref()
            .ok_or_else(|| StepError::new("no certificate status recorded for this iteration"))?;

        let threshold = ctx.config().as_ref().renewal_threshold_pct;
        let decision = decide(status, self.kind, threshold);

        info!(
            agent = self.kind.as_str(),
            action = %decision.action,
            reason = %decision.reason,
            auth_mode = %decision.auth_mode,
            "Renewal decision"
        );

        let output = serde_json::to_value(&decision)
            .map_err(|e| StepError::wrap("failed to serialize decision", e))?;
        ctx.state.data.last_decision = Some(decision);
        Ok(output)
    }
}
