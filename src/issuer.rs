//! Obtaining and renewing certificates.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use eyre::eyre;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::{
    acme::{self, Account, AccountKey, AuthorizationFailed, Directory, Problem},
    challenge::{publish_dns01, ChallengeType, DnsProvider, Http01Responder},
    domain::{is_valid_domain, CertificateRecord, DomainSpec},
    error::{AcmeError, AcmeErrorKind},
    store::CertStore,
};

/// Issues certificates for declared domains.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Runs a complete issuance for `spec`, abandoning it when `cancel` fires.
    async fn issue(
        &self,
        spec: &DomainSpec,
        cancel: &CancellationToken,
    ) -> Result<CertificateRecord, AcmeError>;

    /// Time before expiry from which a certificate is renewed.
    fn renewal_window(&self) -> time::Duration;

    /// Returns `existing` unchanged while it is outside the renewal window, without any network
    /// traffic. Otherwise issues a new certificate.
    async fn obtain_or_renew(
        &self,
        spec: &DomainSpec,
        existing: Option<CertificateRecord>,
        cancel: &CancellationToken,
    ) -> Result<CertificateRecord, AcmeError> {
        if let Some(existing) = existing {
            let now = OffsetDateTime::now_utc();

            if !existing.is_renewable(now, self.renewal_window()) {
                log::debug!(
                    "Certificate of {} is valid for {} more days",
                    spec.domain,
                    existing.valid_days_left(now)
                );
                return Ok(existing);
            }

            log::info!(
                "Renewing certificate of {} ({} days left)",
                spec.domain,
                existing.valid_days_left(now)
            );
        }

        self.issue(spec, cancel).await
    }
}

/// Settings of an [`AcmeIssuer`].
#[derive(Debug, Clone)]
pub struct IssuerOptions {
    pub directory_url: String,
    pub challenge: ChallengeType,

    /// Upper bound for proving control of a domain.
    pub challenge_timeout: Duration,

    /// Upper bound for the CA to issue the certificate after finalizing.
    pub issuance_timeout: Duration,

    /// Delay between polls of pending resources.
    pub poll_interval: Duration,

    pub renewal_window: time::Duration,
}

impl Default for IssuerOptions {
    fn default() -> Self {
        Self {
            directory_url: acme::LETSENCRYPT_URL.to_owned(),
            challenge: ChallengeType::Http01,
            challenge_timeout: Duration::from_secs(90),
            issuance_timeout: Duration::from_secs(90),
            poll_interval: Duration::from_secs(2),
            renewal_window: time::Duration::days(30),
        }
    }
}

/// A bounded wait that ran out.
#[derive(Debug, thiserror::Error)]
enum Timeout {
    #[error("challenge for {0} not validated within {1:?}")]
    Challenge(String, Duration),

    #[error("certificate for {0} not issued within {1:?}")]
    Issuance(String, Duration),
}

/// [`CertificateIssuer`] speaking ACME to a CA.
pub struct AcmeIssuer {
    options: IssuerOptions,
    http: reqwest::Client,
    store: CertStore,
    http01: Http01Responder,
    dns: Option<Arc<dyn DnsProvider>>,
    directory: OnceCell<Directory>,
    accounts: Mutex<HashMap<String, Account>>,
}

impl AcmeIssuer {
    pub fn new(options: IssuerOptions, store: CertStore, http01: Http01Responder) -> Self {
        Self {
            options,
            http: reqwest::Client::new(),
            store,
            http01,
            dns: None,
            directory: OnceCell::new(),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the provider publishing `dns-01` records.
    pub fn with_dns_provider(mut self, provider: Arc<dyn DnsProvider>) -> Self {
        self.dns = Some(provider);
        self
    }

    pub fn options(&self) -> &IssuerOptions {
        &self.options
    }

    /// Returns the registered account of `contact_email`, creating and persisting its key on
    /// first use.
    async fn account(&self, contact_email: &str) -> eyre::Result<Account> {
        // held across registration so one contact never registers twice
        let mut accounts = self.accounts.lock().await;

        if let Some(account) = accounts.get(contact_email) {
            return Ok(account.clone());
        }

        let directory = self
            .directory
            .get_or_try_init(|| Directory::fetch(self.http.clone(), &self.options.directory_url))
            .await?;

        let key = match self.store.load_account_key(contact_email).await? {
            Some(pem) => AccountKey::from_pem(&pem)?,
            None => {
                log::info!("Creating ACME account key for {contact_email}");
                let key = AccountKey::generate();
                self.store
                    .save_account_key(contact_email, &key.to_pem()?)
                    .await?;
                key
            }
        };

        let account = directory.upsert_account(key, contact_email).await?;
        accounts.insert(contact_email.to_owned(), account.clone());

        Ok(account)
    }

    /// Puts the proof for `challenge` in place and has the CA validate it.
    ///
    /// The proof is taken down when this returns or is dropped.
    async fn prove(&self, domain: &str, challenge: &acme::Challenge) -> eyre::Result<()> {
        let delay = self.options.poll_interval;

        match self.options.challenge {
            ChallengeType::Http01 => {
                let _guard = self
                    .http01
                    .register(challenge.token(), &challenge.http_proof()?)
                    .await?;

                challenge.validate(delay).await
            }

            ChallengeType::Dns01 => {
                let provider = self
                    .dns
                    .clone()
                    .ok_or_else(|| eyre!("dns-01 selected but no DNS provider configured"))?;

                let _guard = publish_dns01(provider, domain, &challenge.dns_proof()?).await?;

                challenge.validate(delay).await
            }
        }
    }

    async fn run_order(&self, spec: &DomainSpec) -> eyre::Result<CertificateRecord> {
        let opts = &self.options;

        let account = self.account(&spec.contact_email).await?;
        let order = account.new_order(&spec.domain).await?;

        let authorize = async {
            for auth in order.authorizations().await? {
                if !auth.need_challenge() {
                    log::debug!("{} is already authorized", auth.domain());
                    continue;
                }

                let challenge = auth.challenge(opts.challenge.as_str()).ok_or_else(|| {
                    eyre!("CA offers no {} challenge for {}", opts.challenge, auth.domain())
                })?;

                log::info!(
                    "Proving control of {} with {}",
                    auth.domain(),
                    opts.challenge
                );
                self.prove(auth.domain(), &challenge).await?;
            }

            order.confirm_validations(opts.poll_interval).await
        };

        let order = tokio::time::timeout(opts.challenge_timeout, authorize)
            .await
            .map_err(|_| Timeout::Challenge(spec.domain.clone(), opts.challenge_timeout))??;

        let issue = async {
            order
                .finalize(acme::create_p256_key(), opts.poll_interval)
                .await?
                .download_cert()
                .await
        };

        let record = tokio::time::timeout(opts.issuance_timeout, issue)
            .await
            .map_err(|_| Timeout::Issuance(spec.domain.clone(), opts.issuance_timeout))??;

        Ok(record)
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(
        &self,
        spec: &DomainSpec,
        cancel: &CancellationToken,
    ) -> Result<CertificateRecord, AcmeError> {
        if !is_valid_domain(&spec.domain) {
            return Err(AcmeError::invalid_domain(format!(
                "{:?} is not a fully qualified DNS name",
                spec.domain
            )));
        }

        if cancel.is_cancelled() {
            return Err(AcmeError::cancelled(&spec.domain));
        }

        log::info!("Issuing certificate for {}", spec.domain);

        // dropping the order future takes down any challenge proof it holds
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::info!("Issuance for {} cancelled", spec.domain);
                Err(AcmeError::cancelled(&spec.domain))
            }

            res = self.run_order(spec) => match res {
                Ok(record) => {
                    log::info!(
                        "Issued certificate for {} by {}, expires {}",
                        record.domain,
                        record.issuer,
                        record.expires_at
                    );
                    Ok(record)
                }
                Err(err) => {
                    let err = classify(&err);
                    log::warn!("Issuance for {} failed: {err}", spec.domain);
                    Err(err)
                }
            },
        }
    }

    fn renewal_window(&self) -> time::Duration {
        self.options.renewal_window
    }
}

/// Maps a problem document onto the error taxonomy.
fn problem_kind(problem: &Problem) -> AcmeErrorKind {
    match problem.error_name() {
        "rateLimited" => AcmeErrorKind::RateLimited,
        "rejectedIdentifier" | "unsupportedIdentifier" | "caa" => AcmeErrorKind::InvalidDomain,
        "serverInternal" => AcmeErrorKind::NetworkError,

        _ => match problem.status {
            Some(429) => AcmeErrorKind::RateLimited,
            Some(500..=599) => AcmeErrorKind::NetworkError,

            // anything else is terminal so a misbehaving CA never causes a retry loop
            _ => AcmeErrorKind::ChallengeFailed,
        },
    }
}

/// Classifies a failed issuance by the first recognized error in its chain.
fn classify(err: &eyre::Report) -> AcmeError {
    let detail = format!("{err:#}");

    for cause in err.chain() {
        if let Some(problem) = cause.downcast_ref::<Problem>() {
            return AcmeError::new(problem_kind(problem), detail);
        }

        if let Some(failed) = cause.downcast_ref::<AuthorizationFailed>() {
            let kind = match failed.problem.as_ref().map(problem_kind) {
                Some(AcmeErrorKind::InvalidDomain) => AcmeErrorKind::InvalidDomain,
                _ => AcmeErrorKind::ChallengeFailed,
            };
            return AcmeError::new(kind, detail);
        }

        if let Some(timeout) = cause.downcast_ref::<Timeout>() {
            return match timeout {
                Timeout::Challenge(..) => AcmeError::challenge_failed(detail),
                Timeout::Issuance(..) => AcmeError::network(detail),
            };
        }

        if cause.downcast_ref::<reqwest::Error>().is_some()
            || cause.downcast_ref::<std::io::Error>().is_some()
        {
            return AcmeError::network(detail);
        }
    }

    AcmeError::challenge_failed(detail)
}
