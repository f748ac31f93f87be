//! The execution-agent seam.
//!
//! The scheduler treats agents as opaque workers: one capability trait with a
//! single `invoke` method. Worker selection is a routing concern handled by
//! the registry, injected at dispatch time; the scheduler never branches on
//! agent kind. Retry policy is carried in the request and applied at the
//! agent boundary, never by the scheduler's own control flow.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::errors::{EpicError, Result};

/// Backoff shape for the retry policy handed to the agent boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RetryBackoff {
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
    Linear {
        delay_secs: u64,
    },
    Immediate,
}

/// Retry policy passed through to the execution agent. The scheduler itself
/// only distinguishes terminal success/failure and never loops-and-retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub backoff: RetryBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: RetryBackoff::Immediate,
        }
    }
}

/// The completed output of one upstream dependency, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyOutput {
    pub sprint_id: String,
    pub payload: Option<Value>,
}

/// Work order for one sprint invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub sprint_id: String,
    /// Completed upstream outputs, ordered: declared dependencies first,
    /// then producers of consumed contracts.
    pub dependency_context: Vec<DependencyOutput>,
    /// Contracts the agent may assume finalized.
    pub locked_contracts: Vec<String>,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
}

/// Terminal result of one sprint invocation. The scheduler never inspects
/// `payload` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: AgentStatus,
    pub actual_hours: Option<f64>,
    pub payload: Option<Value>,
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn completed(actual_hours: f64, payload: Option<Value>) -> Self {
        Self {
            status: AgentStatus::Completed,
            actual_hours: Some(actual_hours),
            payload,
            error: None,
        }
    }

    pub fn failed<S: Into<String>>(error: S) -> Self {
        Self {
            status: AgentStatus::Failed,
            actual_hours: None,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// An opaque execution worker.
///
/// Implementations live outside the scheduler, so the boundary speaks
/// `anyhow::Result`; an `Err` is treated as a terminal sprint failure.
#[async_trait]
pub trait ExecutionAgent: Send + Sync + 'static {
    /// Returns the agent's unique name.
    fn name(&self) -> String;

    /// Returns a human-readable description of the agent's purpose.
    fn description(&self) -> String {
        "No description provided".to_string()
    }

    /// Executes one sprint's work order to a terminal outcome.
    async fn invoke(&self, request: AgentRequest) -> anyhow::Result<AgentResponse>;
}

/// Routes sprints to registered agents. A sprint may name its agent
/// explicitly; otherwise the registry default is used.
pub struct AgentRegistry {
    agents: DashMap<String, Arc<dyn ExecutionAgent>>,
    default_agent: RwLock<Option<String>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            default_agent: RwLock::new(None),
        }
    }

    pub fn register(&self, name: &str, agent: Arc<dyn ExecutionAgent>) -> Result<()> {
        if self.agents.contains_key(name) {
            return Err(EpicError::agent(name, "agent already registered"));
        }
        self.agents.insert(name.to_string(), agent);
        Ok(())
    }

    /// Registers an agent and makes it the fallback for sprints that do not
    /// name one.
    pub async fn register_default(&self, name: &str, agent: Arc<dyn ExecutionAgent>) -> Result<()> {
        self.register(name, agent)?;
        *self.default_agent.write().await = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutionAgent>> {
        self.agents.get(name).map(|a| a.clone())
    }

    /// Resolves the agent for a sprint's declared routing. Missing agents are
    /// a structural error surfaced before dispatch.
    pub async fn resolve(&self, declared: Option<&str>) -> Result<Arc<dyn ExecutionAgent>> {
        let name = match declared {
            Some(name) => name.to_string(),
            None => self
                .default_agent
                .read()
                .await
                .clone()
                .ok_or_else(|| EpicError::agent("<default>", "no default agent registered"))?,
        };
        self.get(&name)
            .ok_or_else(|| EpicError::agent(name, "agent not registered"))
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoAgent;

    #[async_trait]
    impl ExecutionAgent for EchoAgent {
        fn name(&self) -> String {
            "echo".to_string()
        }

        async fn invoke(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
            Ok(AgentResponse::completed(
                0.5,
                Some(json!({ "sprint": request.sprint_id })),
            ))
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = AgentRegistry::new();
        registry
            .register_default("echo", Arc::new(EchoAgent))
            .await
            .unwrap();

        let agent = registry.resolve(None).await.unwrap();
        assert_eq!(agent.name(), "echo");
        let agent = registry.resolve(Some("echo")).await.unwrap();
        assert_eq!(agent.name(), "echo");
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = AgentRegistry::new();
        registry.register("echo", Arc::new(EchoAgent)).unwrap();
        assert!(registry.register("echo", Arc::new(EchoAgent)).is_err());
    }

    #[tokio::test]
    async fn test_missing_agent_is_error() {
        let registry = AgentRegistry::new();
        assert!(registry.resolve(None).await.is_err());
        assert!(registry.resolve(Some("ghost")).await.is_err());
    }
}
