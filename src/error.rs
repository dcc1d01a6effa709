//! Error taxonomy for the component contracts.
//!
//! Each component boundary returns a typed error carrying a `kind` the caller can branch on and a
//! human readable `detail`. Internals (protocol layer, storage, config loading) use
//! [`eyre::Result`] and are classified into these types at the boundary.

use std::fmt;

/// Classification of an [`AcmeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcmeErrorKind {
    /// The certificate authority refused the request because of rate limits.
    RateLimited,

    /// Proof of domain control was not accepted, or was not accepted in time.
    ChallengeFailed,

    /// The certificate authority could not be reached or answered with a server error.
    NetworkError,

    /// The domain name is not acceptable for issuance.
    InvalidDomain,

    /// The operation was abandoned because its domain left the declared set.
    Cancelled,
}

impl AcmeErrorKind {
    /// Returns true if the caller may retry with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(self, AcmeErrorKind::RateLimited | AcmeErrorKind::NetworkError)
    }
}

impl fmt::Display for AcmeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcmeErrorKind::RateLimited => "rate limited",
            AcmeErrorKind::ChallengeFailed => "challenge failed",
            AcmeErrorKind::NetworkError => "network error",
            AcmeErrorKind::InvalidDomain => "invalid domain",
            AcmeErrorKind::Cancelled => "cancelled",
        };

        f.write_str(name)
    }
}

/// Failure to obtain or renew a certificate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct AcmeError {
    pub kind: AcmeErrorKind,
    pub detail: String,
}

impl AcmeError {
    pub fn new(kind: AcmeErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::new(AcmeErrorKind::RateLimited, detail)
    }

    pub fn challenge_failed(detail: impl Into<String>) -> Self {
        Self::new(AcmeErrorKind::ChallengeFailed, detail)
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self::new(AcmeErrorKind::NetworkError, detail)
    }

    pub fn invalid_domain(detail: impl Into<String>) -> Self {
        Self::new(AcmeErrorKind::InvalidDomain, detail)
    }

    pub fn cancelled(domain: &str) -> Self {
        Self::new(
            AcmeErrorKind::Cancelled,
            format!("issuance for {domain} was cancelled"),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Classification of a [`RenderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderErrorKind {
    /// The backend address or port of a domain is missing.
    MissingBackend,

    /// A value would produce syntactically broken proxy configuration.
    TemplateError,
}

impl fmt::Display for RenderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderErrorKind::MissingBackend => f.write_str("missing backend"),
            RenderErrorKind::TemplateError => f.write_str("template error"),
        }
    }
}

/// Malformed input given to the config renderer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} for {domain}: {detail}")]
pub struct RenderError {
    pub kind: RenderErrorKind,
    pub domain: String,
    pub detail: String,
}

impl RenderError {
    pub fn missing_backend(domain: &str, detail: impl Into<String>) -> Self {
        Self {
            kind: RenderErrorKind::MissingBackend,
            domain: domain.to_owned(),
            detail: detail.into(),
        }
    }

    pub fn template(domain: &str, detail: impl Into<String>) -> Self {
        Self {
            kind: RenderErrorKind::TemplateError,
            domain: domain.to_owned(),
            detail: detail.into(),
        }
    }
}

/// Classification of a [`ReloadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReloadErrorKind {
    /// The proxy's own validator rejected the staged configuration.
    InvalidConfig,

    /// The process manager could not be asked to reload the proxy.
    ReloadSignalFailed,

    /// The proxy did not come back healthy after a reload; the last confirmed configuration was
    /// restored.
    HealthCheckFailed,

    /// The staged configuration could not be written.
    Io,
}

impl fmt::Display for ReloadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReloadErrorKind::InvalidConfig => "invalid config",
            ReloadErrorKind::ReloadSignalFailed => "reload signal failed",
            ReloadErrorKind::HealthCheckFailed => "health check failed",
            ReloadErrorKind::Io => "i/o error",
        };

        f.write_str(name)
    }
}

/// Failure to apply a configuration artifact to the running proxy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct ReloadError {
    pub kind: ReloadErrorKind,
    pub detail: String,
}

impl ReloadError {
    pub fn new(kind: ReloadErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}
