//! Error taxonomy (spec §7): Routing, Transformation, Queue, Validation, Hook,
//! Compensation. Routing errors are surfaced to callers as structured values,
//! never exceptions — [`RoutingError`] implements `std::error::Error` purely
//! so it composes with `?`, but callers are expected to match on `code()`.

use thiserror::Error;

/// Result alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error aggregating every taxonomy kind from spec §7.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration (priority bounds, missing providers).
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Routing failure from `routeRequest`.
    #[error(transparent)]
    Routing(#[from] RoutingError),
    /// Transformer-chain failure.
    #[error(transparent)]
    Transform(#[from] TransformError),
    /// Queue fabric failure.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// Request/response schema validation failure.
    #[error("validation error: {0}")]
    Validation(String),
    /// Hook pipeline failure (timeout or thrown error after retries).
    #[error(transparent)]
    Hook(#[from] HookError),
    /// The handler function itself returned an error.
    #[error("handler error: {0}")]
    Handler(String),
}

/// Routing error code (spec §6 `RoutingError.code`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RoutingErrorCode {
    /// No handler instance registered for the resolved `(path, tsv)`.
    NoHandler,
    /// No version could be resolved for the route.
    NoVersion,
    /// The resolved instance's health is `unhealthy`.
    Unhealthy,
    /// The `(handlerId, clientId)` rate-limit window is exhausted.
    RateLimited,
    /// Auth gate failed: missing `authContext` or no role overlap.
    Unauthorized,
}

impl RoutingErrorCode {
    /// Wire string as used in `RoutingError.code` (spec §6).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoHandler => "NO_HANDLER",
            Self::NoVersion => "NO_VERSION",
            Self::Unhealthy => "UNHEALTHY",
            Self::RateLimited => "RATE_LIMITED",
            Self::Unauthorized => "UNAUTHORIZED",
        }
    }
}

/// Structured routing error carrying a code, message, and details payload
/// (spec §4.D / §6). Never thrown as an exception by the router itself —
/// `route_request` returns this as the `Err` arm of a `Result`.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("{code:?}: {message}")]
pub struct RoutingError {
    /// Machine-readable code (`NO_HANDLER`, `NO_VERSION`, ...).
    pub code: RoutingErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured details (requested/current counts, required roles, etc.).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RoutingError {
    /// Build a routing error with no details payload.
    #[must_use]
    pub fn new(code: RoutingErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach a details payload.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Machine-readable routing error code.
    #[must_use]
    pub fn code(&self) -> RoutingErrorCode {
        self.code
    }
}

/// Transformer-chain failure (spec §4.B).
#[derive(Debug, Clone, Error)]
pub enum TransformError {
    /// No transformer registered for an adjacent hop in the chain.
    #[error("no transformer from {from} to {to}")]
    MissingHop {
        /// Source TSV of the missing hop.
        from: String,
        /// Destination TSV of the missing hop.
        to: String,
    },
    /// A single transform step exceeded the 5s per-step ceiling.
    #[error("transform step timed out after {0:?}")]
    StepTimeout(std::time::Duration),
    /// A transform function itself returned an error.
    #[error("transform step failed: {0}")]
    StepFailed(String),
    /// The chain would exceed `maxHops = 10`.
    #[error("transform chain exceeds max hops ({0} > 10)")]
    TooManyHops(usize),
}

/// Queue fabric failure (spec §4.E).
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// `queueDepth >= maxQueueDepth` at the moment of `publish`.
    #[error("backpressure active")]
    Backpressure,
    /// The fabric has been told to shut down and refuses new publishes.
    #[error("queue fabric is shutting down")]
    ShuttingDown,
}

/// Hook pipeline failure (spec §4.F).
#[derive(Debug, Clone, Error)]
pub enum HookError {
    /// A hook exceeded its timeout on every attempt (initial + retries).
    #[error("hook {hook_id} timed out after {attempts} attempt(s)")]
    Timeout {
        /// Hook id that timed out.
        hook_id: String,
        /// Attempts made (1 + retries).
        attempts: u32,
    },
    /// A hook returned an error on every attempt.
    #[error("hook {hook_id} failed after {attempts} attempt(s): {message}")]
    Failed {
        /// Hook id that failed.
        hook_id: String,
        /// Attempts made (1 + retries).
        attempts: u32,
        /// The last error message observed.
        message: String,
    },
}
