use thiserror::Error;

/// Unified error type for the epicflow scheduler.
///
/// Structural errors (cycles, contract producer violations, dangling
/// references, resume/plan mismatches) are detected before any dispatch and
/// abort the run synchronously. Execution failures are absorbed into sprint
/// outcomes and never abort the run on their own.
#[derive(Debug, Error)]
pub enum EpicError {
    /// The sprint dependency graph contains a cycle.
    #[error("cycle detected in sprint dependency graph: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// Structural/configuration errors in the epic plan.
    #[error("invalid epic plan: {message}")]
    Structure {
        message: String,
        sprint_id: Option<String>,
        contract: Option<String>,
    },

    /// The durable transition log disagrees with the current plan.
    #[error("resume inconsistency for epic '{epic_id}': {message}")]
    ResumeInconsistency { epic_id: String, message: String },

    /// A sprint-level execution error.
    #[error("sprint '{sprint_id}' failed: {message}")]
    Execution { sprint_id: String, message: String },

    /// Agent lookup or invocation errors.
    #[error("agent '{agent}': {message}")]
    Agent { agent: String, message: String },

    /// A dispatched invocation exceeded its wall-clock bound.
    #[error("operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Persistence layer errors.
    #[error("database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization errors.
    #[error("serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors.
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Invariant violations inside the scheduler itself.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EpicError {
    pub fn cycle(path: Vec<String>) -> Self {
        Self::Cycle { path }
    }

    pub fn structure<S: Into<String>>(message: S) -> Self {
        Self::Structure {
            message: message.into(),
            sprint_id: None,
            contract: None,
        }
    }

    pub fn structure_sprint<S: Into<String>, I: Into<String>>(message: S, sprint_id: I) -> Self {
        Self::Structure {
            message: message.into(),
            sprint_id: Some(sprint_id.into()),
            contract: None,
        }
    }

    pub fn structure_contract<S: Into<String>, C: Into<String>>(message: S, contract: C) -> Self {
        Self::Structure {
            message: message.into(),
            sprint_id: None,
            contract: Some(contract.into()),
        }
    }

    pub fn resume_inconsistency<E: Into<String>, M: Into<String>>(epic_id: E, message: M) -> Self {
        Self::ResumeInconsistency {
            epic_id: epic_id.into(),
            message: message.into(),
        }
    }

    pub fn execution<S: Into<String>, M: Into<String>>(sprint_id: S, message: M) -> Self {
        Self::Execution {
            sprint_id: sprint_id.into(),
            message: message.into(),
        }
    }

    pub fn agent<A: Into<String>, M: Into<String>>(agent: A, message: M) -> Self {
        Self::Agent {
            agent: agent.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn database<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Structural errors abort the run before dispatch and are never retried.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Cycle { .. } | Self::Structure { .. } | Self::ResumeInconsistency { .. }
        )
    }

    /// Error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Cycle { .. } => "cycle",
            Self::Structure { .. } => "structure",
            Self::ResumeInconsistency { .. } => "resume",
            Self::Execution { .. } => "execution",
            Self::Agent { .. } => "agent",
            Self::Timeout { .. } => "timeout",
            Self::Database { .. } => "database",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EpicError>;

impl From<std::io::Error> for EpicError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            operation: "io_operation".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for EpicError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for EpicError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for EpicError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}
