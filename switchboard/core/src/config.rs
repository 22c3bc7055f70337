//! Registry Configuration
//!
//! Configuration types for backends, role assignments, retry policy and the
//! cache layer, plus the validation that runs before a
//! [`Registry`](crate::routing::registry::Registry) is built.
//!
//! # Example Configuration
//!
//! ```toml
//! default_backend = "claude-main"
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 1000
//! max_backoff_ms = 30000
//! multiplier = 2.0
//!
//! [[backends]]
//! id = "claude-main"
//! type = "anthropic"
//! model = "claude-sonnet"
//! api_key = "sk-..."
//! parameters = { temperature = 0.2, max_tokens = 8192 }
//!
//! [[backends]]
//! id = "local-llama"
//! type = "ollama"
//! model = "llama3.2"
//! endpoint = "http://localhost:11434"
//!
//! [[roles]]
//! role = "coder"
//! primary = "claude-main"
//! fallbacks = ["local-llama"]
//! overrides = { temperature = 0.0 }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Parameters a role override may never redefine
pub const CRITICAL_PARAMETERS: &[&str] = &["type", "model", "api_key", "endpoint"];

/// Inclusive temperature bounds
pub const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);

/// Upper bound accepted for `max_tokens`
pub const MAX_TOKENS_LIMIT: u64 = 1_000_000;

static BACKEND_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*[a-z0-9]$").expect("Invalid regex"));

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Backend id does not match the allowed pattern
    #[error("Invalid backend id '{0}': must match ^[a-z0-9][a-z0-9-]*[a-z0-9]$")]
    InvalidBackendId(String),

    /// Two descriptors share an id
    #[error("Duplicate backend id '{0}'")]
    DuplicateBackendId(String),

    /// Model name missing
    #[error("Backend {backend}: model must not be empty")]
    InvalidModel {
        /// Offending backend
        backend: String,
    },

    /// Temperature outside the accepted range or not a number
    #[error("{scope}: temperature {value} is outside [0.0, 2.0]")]
    InvalidTemperature {
        /// Backend or role the value came from
        scope: String,
        /// The rejected value
        value: String,
    },

    /// max_tokens not a positive integer within bounds
    #[error("{scope}: max_tokens {value} must be an integer in 1..=1000000")]
    InvalidMaxTokens {
        /// Backend or role the value came from
        scope: String,
        /// The rejected value
        value: String,
    },

    /// A role is assigned twice
    #[error("Role '{0}' is assigned more than once")]
    DuplicateRole(Role),

    /// A fallback id appears more than once in a chain
    #[error("Role '{role}': duplicate fallback id '{id}'")]
    DuplicateFallback {
        /// Role owning the chain
        role: Role,
        /// Repeated backend id
        id: String,
    },

    /// A role override touches an identity-critical parameter
    #[error("Role '{role}': overriding critical parameter '{key}' is not allowed")]
    CriticalOverride {
        /// Role owning the override
        role: Role,
        /// Forbidden key
        key: String,
    },

    /// A role references a backend that is not configured
    #[error("Role '{role}' references unknown backend '{id}'")]
    UnknownBackendReference {
        /// Role holding the reference
        role: Role,
        /// Missing backend id
        id: String,
    },

    /// The default backend is not configured
    #[error("Default backend '{0}' is not configured")]
    UnknownDefaultBackend(String),

    /// Retry policy out of bounds
    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// Other invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Roles and Backend Types
// =============================================================================

/// Functional category of a request, used to pick a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Breaks work down into steps
    Planner,
    /// Writes code
    Coder,
    /// Reviews produced code
    Reviewer,
    /// Writes and judges tests
    Tester,
    /// Writes prose documentation
    Documenter,
}

impl Role {
    /// Every role, in declaration order
    pub const ALL: [Role; 5] = [
        Self::Planner,
        Self::Coder,
        Self::Reviewer,
        Self::Tester,
        Self::Documenter,
    ];

    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
            Self::Documenter => "documenter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::ValidationError(format!("unknown role '{s}'")))
    }
}

/// Closed set of backend implementations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendType {
    /// Anthropic Messages API
    #[serde(rename = "anthropic")]
    Anthropic,
    /// OpenAI-compatible chat completions
    #[serde(rename = "openai")]
    OpenAi,
    /// Local Ollama server
    #[serde(rename = "ollama")]
    Ollama,
    /// In-process scripted backend for tests
    #[serde(rename = "mock")]
    Mock,
}

impl BackendType {
    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Backend Descriptor
// =============================================================================

/// One configured backend endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Unique operator-chosen identifier
    pub id: String,

    /// Implementation to construct
    #[serde(rename = "type")]
    pub kind: BackendType,

    /// Vendor model name
    pub model: String,

    /// Endpoint override (vendor default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Free-form generation parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl BackendDescriptor {
    /// Create a descriptor with no endpoint, credential or parameters
    pub fn new(id: impl Into<String>, kind: BackendType, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            model: model.into(),
            endpoint: None,
            api_key: None,
            parameters: Map::new(),
        }
    }

    /// Set the endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the credential
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set one parameter
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !BACKEND_ID_PATTERN.is_match(&self.id) {
            return Err(ConfigError::InvalidBackendId(self.id.clone()));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel {
                backend: self.id.clone(),
            });
        }
        validate_generation_parameters(&format!("Backend {}", self.id), &self.parameters)
    }
}

// Credentials stay out of logs
impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("parameters", &self.parameters)
            .finish()
    }
}

// =============================================================================
// Role Assignment
// =============================================================================

/// Which backends serve a role, in preference order
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Role being assigned
    pub role: Role,

    /// Preferred backend id
    pub primary: String,

    /// Ordered fallback backend ids
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Role-specific parameter overrides
    #[serde(default)]
    pub overrides: Map<String, Value>,
}

impl RoleAssignment {
    /// Assign a role to a primary backend
    pub fn new(role: Role, primary: impl Into<String>) -> Self {
        Self {
            role,
            primary: primary.into(),
            fallbacks: Vec::new(),
            overrides: Map::new(),
        }
    }

    /// Set the fallback chain
    #[must_use]
    pub fn with_fallbacks<I, S>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallbacks = fallbacks.into_iter().map(Into::into).collect();
        self
    }

    /// Set one override
    #[must_use]
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Whether the backend is this role's primary or one of its fallbacks
    #[must_use]
    pub fn involves(&self, backend_id: &str) -> bool {
        self.primary == backend_id || self.fallbacks.iter().any(|f| f == backend_id)
    }

    fn validate_shape(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for id in &self.fallbacks {
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::DuplicateFallback {
                    role: self.role,
                    id: id.clone(),
                });
            }
        }

        if let Some(key) = self
            .overrides
            .keys()
            .find(|k| CRITICAL_PARAMETERS.contains(&k.as_str()))
        {
            return Err(ConfigError::CriticalOverride {
                role: self.role,
                key: key.clone(),
            });
        }

        validate_generation_parameters(&format!("Role {}", self.role), &self.overrides)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff_ms: u64,

    /// Upper bound for any single delay
    pub max_backoff_ms: u64,

    /// Growth factor between delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt budget and initial delay, doubling
    #[must_use]
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        let initial_backoff_ms = duration_ms(initial_backoff);
        // Cap high enough that doubling is never clipped within the budget
        let max_backoff_ms = initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(max_attempts))
            .max(Self::default().max_backoff_ms);
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms,
            multiplier: 2.0,
        }
    }

    /// Delay before the first retry
    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Upper bound for any single delay
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay before retry number `attempt` (0-indexed), no jitter
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Check bounds: 1–10 attempts, positive initial delay, growing delays
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.max_attempts) {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "max_attempts {} must be between 1 and 10",
                self.max_attempts
            )));
        }
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "initial_backoff_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_backoff_ms <= self.initial_backoff_ms {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "max_backoff_ms {} must exceed initial_backoff_ms {}",
                self.max_backoff_ms, self.initial_backoff_ms
            )));
        }
        if !(self.multiplier > 1.0) {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "multiplier {} must be greater than 1.0",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Toggles for the two caching mechanisms
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Wrap every backend in the full-response cache
    pub response_cache: bool,

    /// Enable vendor-assisted partial-prompt caching bookkeeping
    pub prompt_cache: bool,
}

// =============================================================================
// Registry Configuration
// =============================================================================

/// Complete, validated input for building a registry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Configured backends
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,

    /// Role table
    #[serde(default)]
    pub roles: Vec<RoleAssignment>,

    /// Backend used for roles with no resolvable assignment
    #[serde(default)]
    pub default_backend: Option<String>,

    /// Retry policy, documented default when absent
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Shared deadline for startup validation
    #[serde(default = "default_validation_timeout_ms")]
    pub validation_timeout_ms: u64,

    /// Per-backend bound during shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Cache layer toggles
    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_validation_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            roles: Vec::new(),
            default_backend: None,
            retry: RetryPolicy::default(),
            validation_timeout_ms: default_validation_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            cache: CacheConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loaded registry config");
        Self::from_toml_str(&content)
    }

    /// Add a backend
    #[must_use]
    pub fn with_backend(mut self, descriptor: BackendDescriptor) -> Self {
        self.backends.push(descriptor);
        self
    }

    /// Add a role assignment
    #[must_use]
    pub fn with_role(mut self, assignment: RoleAssignment) -> Self {
        self.roles.push(assignment);
        self
    }

    /// Set the default backend
    #[must_use]
    pub fn with_default_backend(mut self, id: impl Into<String>) -> Self {
        self.default_backend = Some(id.into());
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the cache toggles
    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Shared deadline for startup validation
    #[must_use]
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    /// Per-backend bound during shutdown
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Look up a descriptor
    #[must_use]
    pub fn backend(&self, id: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Validate everything, stopping at the first problem
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for descriptor in &self.backends {
            descriptor.validate()?;
            if !ids.insert(descriptor.id.as_str()) {
                return Err(ConfigError::DuplicateBackendId(descriptor.id.clone()));
            }
        }

        let mut roles = HashSet::new();
        for assignment in &self.roles {
            if !roles.insert(assignment.role) {
                return Err(ConfigError::DuplicateRole(assignment.role));
            }
            assignment.validate_shape()?;
            for id in std::iter::once(&assignment.primary).chain(&assignment.fallbacks) {
                if !ids.contains(id.as_str()) {
                    return Err(ConfigError::UnknownBackendReference {
                        role: assignment.role,
                        id: id.clone(),
                    });
                }
            }
        }

        if let Some(default) = &self.default_backend {
            if !ids.contains(default.as_str()) {
                return Err(ConfigError::UnknownDefaultBackend(default.clone()));
            }
        }

        self.retry.validate()?;

        if self.validation_timeout_ms == 0 || self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "validation_timeout_ms and shutdown_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Merge role overrides over backend-global parameters, key by key
#[must_use]
pub fn merge_parameters(global: &Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = global.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn validate_generation_parameters(scope: &str, parameters: &Map<String, Value>) -> Result<(), ConfigError> {
    if let Some(value) = parameters.get("temperature") {
        let in_range = value
            .as_f64()
            .is_some_and(|t| (TEMPERATURE_RANGE.0..=TEMPERATURE_RANGE.1).contains(&t));
        if !in_range {
            return Err(ConfigError::InvalidTemperature {
                scope: scope.to_string(),
                value: value.to_string(),
            });
        }
    }

    if let Some(value) = parameters.get("max_tokens") {
        let in_range = value
            .as_u64()
            .is_some_and(|n| (1..=MAX_TOKENS_LIMIT).contains(&n));
        if !in_range {
            return Err(ConfigError::InvalidMaxTokens {
                scope: scope.to_string(),
                value: value.to_string(),
            });
        }
    }

    Ok(())
}
