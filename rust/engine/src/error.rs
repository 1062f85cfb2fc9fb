use serde::ser::SerializeMap;

/// Errors that can occur while planning or executing a check run.
///
/// Organized into three categories:
/// - **Retryable**: transient provider failures that may succeed on retry
/// - **Terminal**: permanent failures for a single check execution
/// - **Structural**: problems with the check catalog or the run itself
///
/// Additionally, wrapper variants for standard library and serde errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    // -- Retryable --
    /// Rate limit exceeded by a provider.
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// Network request or provider call timed out.
    #[error("network timeout: {message}")]
    NetworkTimeout { message: String },

    /// Service temporarily unavailable.
    #[error("temporarily unavailable: {message}")]
    TemporaryUnavailable { message: String },

    // -- Terminal --
    /// A provider rejected or failed the execution permanently.
    #[error("provider failed for check {check_id}: {reason}")]
    ProviderFailed { check_id: String, reason: String },

    /// The provider configuration embedded in a check is invalid.
    #[error("invalid provider config for check {check_id}: {reason}")]
    ProviderConfig { check_id: String, reason: String },

    /// A named `fail_if` predicate evaluated to true.
    #[error("fail_if predicate `{predicate}` matched for check {check_id}")]
    PredicateMatched { check_id: String, predicate: String },

    /// Reusing a parent AI session failed (missing parent, clone rejection).
    #[error("session reuse failed for check {check_id}: {reason}")]
    SessionReuse { check_id: String, reason: String },

    // -- Structural --
    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving: {}", nodes.join(", "))]
    PlanningCycle { nodes: Vec<String> },

    /// A referenced check does not exist in the catalog.
    #[error("unknown check: {check_id}")]
    UnknownCheck { check_id: String },

    /// The configuration document is invalid.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// An `if`/`fail_if`/routing expression failed to compile.
    #[error("invalid expression `{expression}`: {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// The nested workflow depth limit was exceeded.
    #[error("workflow depth limit of {limit} exceeded")]
    DepthLimit { limit: u32 },

    /// The run was shut down before completion.
    #[error("shutdown: {reason}")]
    Shutdown { reason: String },

    // -- Wrappers --
    /// An I/O error occurred.
    #[error("io error: {message}")]
    Io { message: String },

    /// A JSON serialization/deserialization error occurred.
    #[error("json error: {message}")]
    Json { message: String },

    /// A YAML deserialization error occurred.
    #[error("yaml error: {message}")]
    Yaml { message: String },

    /// An HTTP transport error occurred.
    #[error("http error: {message}")]
    Http { message: String },
}

impl EngineError {
    /// Whether the error is retryable (transient).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::NetworkTimeout { .. }
            | Self::TemporaryUnavailable { .. }
            | Self::Http { .. }
            | Self::Io { .. } => true,

            Self::ProviderFailed { .. }
            | Self::ProviderConfig { .. }
            | Self::PredicateMatched { .. }
            | Self::SessionReuse { .. }
            | Self::PlanningCycle { .. }
            | Self::UnknownCheck { .. }
            | Self::InvalidConfig { .. }
            | Self::InvalidExpression { .. }
            | Self::DepthLimit { .. }
            | Self::Shutdown { .. }
            | Self::Json { .. }
            | Self::Yaml { .. } => false,
        }
    }

    /// Whether the error is terminal for a single check execution.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::ProviderFailed { .. }
            | Self::ProviderConfig { .. }
            | Self::PredicateMatched { .. }
            | Self::SessionReuse { .. }
            | Self::Json { .. } => true,

            Self::RateLimited { .. }
            | Self::NetworkTimeout { .. }
            | Self::TemporaryUnavailable { .. }
            | Self::Http { .. }
            | Self::Io { .. }
            | Self::PlanningCycle { .. }
            | Self::UnknownCheck { .. }
            | Self::InvalidConfig { .. }
            | Self::InvalidExpression { .. }
            | Self::DepthLimit { .. }
            | Self::Shutdown { .. }
            | Self::Yaml { .. } => false,
        }
    }

    /// Whether the error is structural (catalog or run level).
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::PlanningCycle { .. }
                | Self::UnknownCheck { .. }
                | Self::InvalidConfig { .. }
                | Self::InvalidExpression { .. }
                | Self::DepthLimit { .. }
                | Self::Yaml { .. }
        )
    }

    /// A unique error code string for this variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::NetworkTimeout { .. } => "NETWORK_TIMEOUT",
            Self::TemporaryUnavailable { .. } => "TEMPORARY_UNAVAILABLE",
            Self::ProviderFailed { .. } => "PROVIDER_FAILED",
            Self::ProviderConfig { .. } => "PROVIDER_CONFIG",
            Self::PredicateMatched { .. } => "PREDICATE_MATCHED",
            Self::SessionReuse { .. } => "SESSION_REUSE_FAILED",
            Self::PlanningCycle { .. } => "PLANNING_CYCLE",
            Self::UnknownCheck { .. } => "UNKNOWN_CHECK",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::InvalidExpression { .. } => "INVALID_EXPRESSION",
            Self::DepthLimit { .. } => "DEPTH_LIMIT_EXCEEDED",
            Self::Shutdown { .. } => "SHUTDOWN",
            Self::Io { .. } => "IO_ERROR",
            Self::Json { .. } => "JSON_ERROR",
            Self::Yaml { .. } => "YAML_ERROR",
            Self::Http { .. } => "HTTP_ERROR",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::NetworkTimeout {
                message: err.to_string(),
            }
        } else {
            Self::Http {
                message: err.to_string(),
            }
        }
    }
}

impl serde::Serialize for EngineError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("code", self.code())?;
        map.serialize_entry("message", &self.to_string())?;
        map.end()
    }
}

/// A `Result` type alias using [`EngineError`].
pub type EngineResult<T> = Result<T, EngineError>;
