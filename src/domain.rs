//! Declared domains, issued certificates and per-domain reconciliation state.

use std::{
    fmt,
    io::{BufReader, Cursor},
};

use der::Decode as _;
use eyre::{eyre, WrapErr as _};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use zeroize::Zeroizing;

/// A domain that should be served over TLS in front of a backend.
///
/// The domain name is the unique key of the declared set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainSpec {
    pub domain: String,
    pub backend_address: String,
    pub backend_port: u16,
    pub contact_email: String,
}

impl DomainSpec {
    pub fn new(
        domain: impl Into<String>,
        backend_address: impl Into<String>,
        backend_port: u16,
        contact_email: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            backend_address: backend_address.into(),
            backend_port,
            contact_email: contact_email.into(),
        }
    }
}

/// Returns true if `name` is a fully qualified, non-wildcard DNS name made of LDH labels.
pub fn is_valid_domain(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);

    if name.is_empty() || name.len() > 253 || !name.contains('.') {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Certificate material issued for one domain.
///
/// Records are replaced on renewal, never modified.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub domain: String,

    /// End-entity certificate in PEM format.
    pub cert_pem: String,

    /// Private key of the end-entity certificate in PKCS#8 PEM format.
    pub key_pem: Zeroizing<String>,

    /// Intermediate certificates in PEM format, possibly empty.
    pub chain_pem: String,

    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,

    /// Issuer distinguished name of the end-entity certificate.
    pub issuer: String,
}

impl CertificateRecord {
    /// Constructs a record, checking that it expires after it was issued.
    pub fn new(
        domain: impl Into<String>,
        cert_pem: impl Into<String>,
        key_pem: Zeroizing<String>,
        chain_pem: impl Into<String>,
        issued_at: OffsetDateTime,
        expires_at: OffsetDateTime,
        issuer: impl Into<String>,
    ) -> eyre::Result<Self> {
        let domain = domain.into();

        if expires_at <= issued_at {
            return Err(eyre!(
                "certificate for {domain} expires ({expires_at}) before it is issued ({issued_at})"
            ));
        }

        Ok(Self {
            domain,
            cert_pem: cert_pem.into(),
            key_pem,
            chain_pem: chain_pem.into(),
            issued_at,
            expires_at,
            issuer: issuer.into(),
        })
    }

    /// Builds a record from a downloaded PEM certificate chain.
    ///
    /// The first certificate is the end-entity certificate; its validity period and issuer fill
    /// in the record. Remaining certificates become the chain.
    pub fn from_pem(
        domain: &str,
        key_pem: Zeroizing<String>,
        full_chain_pem: &str,
    ) -> eyre::Result<Self> {
        let mut rdr = BufReader::new(Cursor::new(full_chain_pem));

        let ders = rustls_pemfile::certs(&mut rdr)
            .map(|res| res.map(|cert| cert.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .wrap_err("reading certificate chain")?;

        let (leaf_der, chain_ders) = ders
            .split_first()
            .ok_or_else(|| eyre!("no certificates in chain for {domain}"))?;

        let leaf = x509_cert::Certificate::from_der(leaf_der)
            .wrap_err("decoding end-entity certificate")?;

        let validity = &leaf.tbs_certificate.validity;
        let issued_at = OffsetDateTime::UNIX_EPOCH + validity.not_before.to_unix_duration();
        let expires_at = OffsetDateTime::UNIX_EPOCH + validity.not_after.to_unix_duration();
        let issuer = leaf.tbs_certificate.issuer.to_string();

        let cert_pem = pem::encode_string("CERTIFICATE", pem::LineEnding::LF, leaf_der)?;

        let mut chain_pem = String::new();
        for der in chain_ders {
            chain_pem.push_str(&pem::encode_string(
                "CERTIFICATE",
                pem::LineEnding::LF,
                der,
            )?);
        }

        Self::new(
            domain, cert_pem, key_pem, chain_pem, issued_at, expires_at, issuer,
        )
    }

    /// End-entity certificate followed by the intermediates.
    pub fn full_chain(&self) -> String {
        format!("{}{}", self.cert_pem, self.chain_pem)
    }

    /// Point in time from which the certificate should be renewed.
    pub fn renew_after(&self, renewal_window: time::Duration) -> OffsetDateTime {
        self.expires_at - renewal_window
    }

    pub fn is_renewable(&self, now: OffsetDateTime, renewal_window: time::Duration) -> bool {
        now >= self.renew_after(renewal_window)
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    /// Whole days of validity left; negative for expired certificates.
    pub fn valid_days_left(&self, now: OffsetDateTime) -> i64 {
        (self.expires_at - now).whole_days()
    }
}

// key material stays out of logs
impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("domain", &self.domain)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

/// Why a domain stopped progressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub reason: String,

    /// Retryable failures are attempted again after a backoff delay. Others wait for the
    /// declaration to change or for an operator reset.
    pub retryable: bool,
}

/// Position of a domain in the reconciliation life cycle.
///
/// ```text
/// Pending -> Issuing -> Issued -> ConfigStaged -> Live
///               ^                                  |
///               +------- renewal window -----------+
/// any -> Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ReconciliationState {
    Pending,
    Issuing,
    Issued,
    ConfigStaged,
    Live,
    Failed(Failure),
}

impl ReconciliationState {
    pub fn failed(reason: impl Into<String>, retryable: bool) -> Self {
        ReconciliationState::Failed(Failure {
            reason: reason.into(),
            retryable,
        })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ReconciliationState::Failed(_))
    }
}

impl fmt::Display for ReconciliationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationState::Pending => f.write_str("pending"),
            ReconciliationState::Issuing => f.write_str("issuing"),
            ReconciliationState::Issued => f.write_str("issued"),
            ReconciliationState::ConfigStaged => f.write_str("config-staged"),
            ReconciliationState::Live => f.write_str("live"),
            ReconciliationState::Failed(failure) => write!(f, "failed ({})", failure.reason),
        }
    }
}

/// Operator-facing snapshot of one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainStatus {
    pub domain: String,
    pub state: ReconciliationState,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub retry_at: Option<OffsetDateTime>,
}

/// Domain states as last recorded by a running reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub written_at: OffsetDateTime,
    pub domains: Vec<DomainStatus>,
}

impl StatusSnapshot {
    pub fn new(domains: Vec<DomainStatus>) -> Self {
        Self {
            written_at: OffsetDateTime::now_utc(),
            domains,
        }
    }

    pub fn get(&self, domain: &str) -> Option<&DomainStatus> {
        self.domains.iter().find(|status| status.domain == domain)
    }
}
