//! Drives every declared domain towards a live TLS configuration.
//!
//! A pass runs the certificate work of all eligible domains concurrently, at most one ACME
//! operation per domain at a time, then renders and applies the proxy configuration. Rendering
//! and applying are serialized across passes and rendering happens inside that section, so an
//! older artifact never replaces a newer one.
//!
//! After every pass the domain states are saved to the certificate store, where
//! `certsync status` reads them.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::future;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::Backoff,
    domain::{DomainSpec, DomainStatus, Failure, ReconciliationState, StatusSnapshot},
    error::{AcmeErrorKind, ReloadError, RenderError},
    issuer::CertificateIssuer,
    reload::{ApplyOutcome, ReloadCoordinator},
    render::ConfigRenderer,
    store::CertStore,
};

/// Why the configuration step of a pass did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigFailure {
    #[error("rendering failed: {0}")]
    Render(RenderError),

    #[error("applying failed: {0}")]
    Reload(ReloadError),

    #[error("reading stored certificates failed: {0}")]
    Storage(String),
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Domains that received a new certificate.
    pub issued: Vec<String>,

    /// Domains whose certificate was left as is.
    pub unchanged: Vec<String>,

    pub failed: Vec<String>,

    /// Domains not attempted because of a pending retry delay or a terminal failure.
    pub skipped: Vec<String>,

    pub applied: Option<ApplyOutcome>,
    pub config_error: Option<ConfigFailure>,
}

impl PassReport {
    /// Returns true if every attempted domain succeeded and the configuration is live.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.config_error.is_none()
    }
}

struct Entry {
    /// Distinguishes a re-declared domain from its removed predecessor.
    id: u64,
    spec: DomainSpec,
    state: ReconciliationState,
    attempts: u32,
    retry_at: Option<OffsetDateTime>,
    expires_at: Option<OffsetDateTime>,
    cancel: CancellationToken,

    /// Held for the duration of the domain's certificate work.
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Entry {
    fn new(id: u64, spec: DomainSpec, cancel: CancellationToken) -> Self {
        Self {
            id,
            spec,
            state: ReconciliationState::Pending,
            attempts: 0,
            retry_at: None,
            expires_at: None,
            cancel,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn reset(&mut self) {
        self.state = ReconciliationState::Pending;
        self.attempts = 0;
        self.retry_at = None;
    }

    fn is_due(&self, now: OffsetDateTime) -> bool {
        match &self.state {
            ReconciliationState::Failed(Failure {
                retryable: false, ..
            }) => false,
            ReconciliationState::Failed(_) => self.retry_at.map_or(true, |at| at <= now),
            _ => true,
        }
    }

    fn status(&self) -> DomainStatus {
        DomainStatus {
            domain: self.spec.domain.clone(),
            state: self.state.clone(),
            expires_at: self.expires_at,
            retry_at: self.retry_at,
        }
    }
}

struct Work {
    id: u64,
    spec: DomainSpec,
    cancel: CancellationToken,
    lock: Arc<tokio::sync::Mutex<()>>,
}

enum Outcome {
    Issued,
    Unchanged,
    Failed,
    Cancelled,
}

/// Owner of the per-domain reconciliation state.
pub struct Reconciler {
    issuer: Arc<dyn CertificateIssuer>,
    renderer: ConfigRenderer,
    coordinator: ReloadCoordinator,
    store: CertStore,
    backoff: Backoff,
    entries: parking_lot::Mutex<BTreeMap<String, Entry>>,
    next_id: AtomicU64,

    /// Serializes render + apply; tokio's mutex queues waiters fairly.
    apply_lock: tokio::sync::Mutex<()>,

    status_lock: tokio::sync::Mutex<()>,

    /// Parent of every entry's cancellation token.
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        renderer: ConfigRenderer,
        coordinator: ReloadCoordinator,
        store: CertStore,
    ) -> Self {
        Self {
            issuer,
            renderer,
            coordinator,
            store,
            backoff: Backoff::default(),
            entries: parking_lot::Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            apply_lock: tokio::sync::Mutex::new(()),
            status_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replaces the declared set of domains.
    ///
    /// New domains start `Pending`. A failed domain whose spec changed is reset. Removed domains
    /// have their in-flight work cancelled and all stored material deleted.
    pub async fn set_domains(&self, specs: impl IntoIterator<Item = DomainSpec>) {
        let declared = specs
            .into_iter()
            .map(|spec| (spec.domain.clone(), spec))
            .collect::<BTreeMap<_, _>>();

        let removed = {
            let mut entries = self.entries.lock();

            let gone = entries
                .keys()
                .filter(|domain| !declared.contains_key(*domain))
                .cloned()
                .collect::<Vec<_>>();

            let removed = gone
                .iter()
                .filter_map(|domain| entries.remove(domain))
                .collect::<Vec<_>>();

            for (domain, spec) in declared {
                match entries.get_mut(&domain) {
                    Some(entry) if entry.spec != spec => {
                        log::info!("Declaration of {domain} changed");

                        if entry.state.is_failed() {
                            entry.reset();
                        }
                        entry.spec = spec;
                    }
                    Some(_) => {}
                    None => {
                        log::info!("Declared {domain}");

                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let cancel = self.shutdown.child_token();
                        entries.insert(domain, Entry::new(id, spec, cancel));
                    }
                }
            }

            removed
        };

        for entry in removed {
            let domain = &entry.spec.domain;
            log::info!("{domain} is no longer declared");

            entry.cancel.cancel();

            // wait for cancelled work to wind down before deleting what it may have written
            let _guard = entry.lock.lock().await;

            if let Err(err) = self.store.remove(domain).await {
                log::warn!("Failed to delete stored material of {domain}: {err:#}");
            }
        }

        self.prune_store().await;
        self.save_status().await;
    }

    /// Deletes stored material of domains outside the declared set.
    async fn prune_store(&self) {
        let stored = match self.store.load_all().await {
            Ok(stored) => stored,
            Err(err) => {
                log::warn!("Failed to list stored certificates: {err:#}");
                return;
            }
        };

        for domain in stored.keys() {
            if self.entries.lock().contains_key(domain) {
                continue;
            }

            log::info!("Deleting stored material of undeclared domain {domain}");

            if let Err(err) = self.store.remove(domain).await {
                log::warn!("Failed to delete stored material of {domain}: {err:#}");
            }
        }
    }

    /// Cancels in-flight and future certificate work of every domain.
    ///
    /// The configuration step of a running pass is not interrupted.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Clears the failure of `domain` so the next pass attempts it again.
    ///
    /// Returns false if the domain is not declared.
    pub fn reset(&self, domain: &str) -> bool {
        let mut entries = self.entries.lock();

        match entries.get_mut(domain) {
            Some(entry) => {
                if entry.state.is_failed() {
                    log::info!("Resetting failed state of {domain}");
                    entry.reset();
                }
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> Vec<DomainStatus> {
        self.entries.lock().values().map(Entry::status).collect()
    }

    pub fn status_of(&self, domain: &str) -> Option<DomainStatus> {
        self.entries.lock().get(domain).map(Entry::status)
    }

    /// Earliest time a retryable failure becomes due.
    pub fn next_retry_at(&self) -> Option<OffsetDateTime> {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.state.is_failed())
            .filter_map(|entry| entry.retry_at)
            .min()
    }

    /// Runs one reconciliation pass over the declared domains.
    ///
    /// Passes are idempotent and may run concurrently.
    pub async fn run_pass(&self) -> PassReport {
        let now = OffsetDateTime::now_utc();
        let mut report = PassReport::default();

        let work = {
            let entries = self.entries.lock();
            let mut work = Vec::with_capacity(entries.len());

            for entry in entries.values() {
                if !entry.is_due(now) {
                    report.skipped.push(entry.spec.domain.clone());
                    continue;
                }

                work.push(Work {
                    id: entry.id,
                    spec: entry.spec.clone(),
                    cancel: entry.cancel.clone(),
                    lock: Arc::clone(&entry.lock),
                });
            }

            work
        };

        log::debug!(
            "Reconciling {} domains ({} skipped)",
            work.len(),
            report.skipped.len()
        );

        let outcomes = future::join_all(work.iter().map(|work| self.reconcile_domain(work))).await;

        for (work, outcome) in work.iter().zip(outcomes) {
            let domain = work.spec.domain.clone();

            match outcome {
                Outcome::Issued => report.issued.push(domain),
                Outcome::Unchanged => report.unchanged.push(domain),
                Outcome::Failed => report.failed.push(domain),
                Outcome::Cancelled => {}
            }
        }

        if self.shutdown.is_cancelled() {
            log::info!("Shutting down, skipping proxy configuration");
        } else {
            self.apply_config(&mut report).await;
        }

        self.save_status().await;

        report
    }

    /// Writes the current domain states to the certificate store.
    async fn save_status(&self) {
        let _serial = self.status_lock.lock().await;

        let snapshot = StatusSnapshot::new(self.status());
        if let Err(err) = self.store.save_status(&snapshot).await {
            log::warn!("Failed to save domain status: {err:#}");
        }
    }

    async fn reconcile_domain(&self, work: &Work) -> Outcome {
        let domain = &work.spec.domain;

        let _guard = work.lock.lock().await;

        if work.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        if let Err(err) = self.renderer.check(&work.spec) {
            self.fail(work, err.to_string(), false);
            return Outcome::Failed;
        }

        let existing = match self.store.load(domain).await {
            Ok(existing) => existing,
            Err(err) => {
                log::warn!("Ignoring unreadable certificate of {domain}: {err:#}");
                None
            }
        };

        let now = OffsetDateTime::now_utc();
        let renewing = existing
            .as_ref()
            .map_or(true, |cert| cert.is_renewable(now, self.issuer.renewal_window()));

        let expires_at = existing.as_ref().map(|cert| cert.expires_at);
        self.update(work, |entry| {
            entry.expires_at = expires_at;

            if renewing {
                entry.state = ReconciliationState::Issuing;
            }
        });

        let res = self
            .issuer
            .obtain_or_renew(&work.spec, existing.clone(), &work.cancel)
            .await;

        let record = match res {
            Ok(record) => record,
            Err(err) if err.kind == AcmeErrorKind::Cancelled => return Outcome::Cancelled,
            Err(err) => {
                self.fail(work, err.to_string(), err.is_retryable());
                return Outcome::Failed;
            }
        };

        // removal waits for this lock, so nothing is written after it deletes the material
        if work.cancel.is_cancelled() {
            return Outcome::Cancelled;
        }

        let fresh = existing.as_ref() != Some(&record);

        if fresh {
            if let Err(err) = self.store.save(&record).await {
                self.fail(work, format!("storing certificate: {err:#}"), true);
                return Outcome::Failed;
            }

            log::info!(
                "Stored certificate of {domain}, valid until {}",
                record.expires_at
            );
        }

        self.update(work, |entry| {
            entry.attempts = 0;
            entry.retry_at = None;
            entry.expires_at = Some(record.expires_at);

            let in_config = matches!(
                entry.state,
                ReconciliationState::ConfigStaged | ReconciliationState::Live
            );

            if fresh || !in_config {
                entry.state = ReconciliationState::Issued;
            }
        });

        if fresh {
            Outcome::Issued
        } else {
            Outcome::Unchanged
        }
    }

    fn update(&self, work: &Work, f: impl FnOnce(&mut Entry)) {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries
            .get_mut(&work.spec.domain)
            .filter(|entry| entry.id == work.id)
        {
            f(entry);
        }
    }

    fn fail(&self, work: &Work, reason: String, retryable: bool) {
        let domain = &work.spec.domain;

        self.update(work, |entry| {
            entry.attempts = entry.attempts.saturating_add(1);

            if retryable {
                let delay = self.backoff.delay(entry.attempts - 1);
                entry.retry_at = Some(OffsetDateTime::now_utc() + delay);

                log::warn!(
                    "Reconciling {domain} failed (attempt {}), retrying in {delay:?}: {reason}",
                    entry.attempts
                );
            } else {
                entry.retry_at = None;

                log::error!("Reconciling {domain} failed permanently: {reason}");
            }

            entry.state = ReconciliationState::failed(reason, retryable);
        });
    }

    async fn apply_config(&self, report: &mut PassReport) {
        let _serial = self.apply_lock.lock().await;

        let specs = {
            let entries = self.entries.lock();
            entries
                .values()
                .map(|entry| entry.spec.clone())
                .filter(|spec| self.renderer.check(spec).is_ok())
                .collect::<Vec<_>>()
        };

        let mut certs = match self.store.load_all().await {
            Ok(certs) => certs,
            Err(err) => {
                report.config_error = Some(ConfigFailure::Storage(format!("{err:#}")));
                return;
            }
        };

        let declared = specs
            .iter()
            .map(|spec| spec.domain.as_str())
            .collect::<HashSet<_>>();
        certs.retain(|domain, _| declared.contains(domain.as_str()));

        let artifact = match self
            .renderer
            .render(&specs, &certs, OffsetDateTime::now_utc())
        {
            Ok(artifact) => artifact,
            Err(err) => {
                log::error!("Rendering proxy configuration failed: {err}");
                report.config_error = Some(ConfigFailure::Render(err));
                return;
            }
        };

        let rendered = artifact
            .tls_domains
            .iter()
            .chain(&artifact.stub_domains)
            .map(String::as_str)
            .collect::<HashSet<_>>();

        {
            let mut entries = self.entries.lock();

            for (domain, entry) in entries.iter_mut() {
                if entry.state == ReconciliationState::Issued && rendered.contains(domain.as_str())
                {
                    entry.state = ReconciliationState::ConfigStaged;
                }
            }
        }

        match self.coordinator.apply(&artifact).await {
            Ok(outcome) => {
                let mut entries = self.entries.lock();

                for (domain, entry) in entries.iter_mut() {
                    if entry.state == ReconciliationState::ConfigStaged
                        && rendered.contains(domain.as_str())
                    {
                        log::info!("{domain} is live");
                        entry.state = ReconciliationState::Live;
                    }
                }

                report.applied = Some(outcome);
            }
            Err(err) => {
                log::error!("Applying proxy configuration failed: {err}");
                report.config_error = Some(ConfigFailure::Reload(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use super::*;
    use crate::{
        error::{AcmeError, ReloadErrorKind},
        render::certificate_identity,
        test::{fake_reconciler, record, FakeIssuer, FakeProxy},
    };

    struct Harness {
        dir: tempfile::TempDir,
        issuer: Arc<FakeIssuer>,
        proxy: Arc<FakeProxy>,
        store: CertStore,
        reconciler: Arc<Reconciler>,
    }

    impl Harness {
        fn new(issuer: FakeIssuer) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let issuer = Arc::new(issuer);
            let proxy = Arc::new(FakeProxy::default());

            let reconciler = fake_reconciler(dir.path(), issuer.clone(), proxy.clone());

            Self {
                store: CertStore::new(dir.path().join("certs")),
                dir,
                issuer,
                proxy,
                reconciler: Arc::new(reconciler),
            }
        }

        fn live_path(&self) -> PathBuf {
            self.dir.path().join("certsync.conf")
        }

        fn live(&self) -> String {
            std::fs::read_to_string(self.live_path()).unwrap()
        }

        fn state(&self, domain: &str) -> ReconciliationState {
            self.reconciler.status_of(domain).unwrap().state
        }

        fn reloads(&self) -> usize {
            self.proxy
                .calls()
                .iter()
                .filter(|call| **call == "reload")
                .count()
        }
    }

    fn spec(domain: &str) -> DomainSpec {
        DomainSpec::new(domain, "127.0.0.1", 8080, "ops@example.com")
    }

    #[tokio::test]
    async fn test_example_com_goes_live() {
        let h = Harness::new(FakeIssuer::new());
        h.reconciler.set_domains([spec("example.com")]).await;

        assert_eq!(h.state("example.com"), ReconciliationState::Pending);

        let report = h.reconciler.run_pass().await;

        assert_eq!(report.issued, ["example.com"]);
        assert_eq!(report.applied, Some(ApplyOutcome::Applied));
        assert!(report.is_clean());
        assert_eq!(h.state("example.com"), ReconciliationState::Live);

        let status = h.reconciler.status_of("example.com").unwrap();
        assert!(status.expires_at.is_some());
        assert_eq!(status.retry_at, None);

        let live = h.live();
        assert!(live.contains("server_name example.com;"));
        assert!(live.contains("listen 443 ssl;"));
        assert!(live.contains("server 127.0.0.1:8080;"));
        assert!(h.store.load("example.com").await.unwrap().is_some());

        // a second pass changes nothing
        let report = h.reconciler.run_pass().await;
        assert_eq!(report.unchanged, ["example.com"]);
        assert_eq!(report.applied, Some(ApplyOutcome::Unchanged));
        assert_eq!(h.issuer.calls("example.com"), 1);
        assert_eq!(h.proxy.calls(), ["validate", "reload"]);
    }

    #[tokio::test]
    async fn test_valid_certificate_not_reissued() {
        let h = Harness::new(FakeIssuer::new());
        let existing = record("example.com", 1, 89);
        h.store.save(&existing).await.unwrap();

        h.reconciler.set_domains([spec("example.com")]).await;
        let report = h.reconciler.run_pass().await;

        assert_eq!(report.unchanged, ["example.com"]);
        assert_eq!(h.issuer.calls("example.com"), 0);
        assert_eq!(h.state("example.com"), ReconciliationState::Live);
        assert_eq!(
            h.store.load("example.com").await.unwrap().unwrap(),
            existing
        );
    }

    #[tokio::test]
    async fn test_validator_rejection_stays_staged() {
        let h = Harness::new(FakeIssuer::new());
        h.proxy.set_reject(true);

        h.reconciler.set_domains([spec("example.com")]).await;
        let report = h.reconciler.run_pass().await;

        assert_eq!(report.issued, ["example.com"]);
        match report.config_error {
            Some(ConfigFailure::Reload(err)) => assert_eq!(err.kind, ReloadErrorKind::InvalidConfig),
            other => panic!("unexpected config result: {other:?}"),
        }
        assert_eq!(h.state("example.com"), ReconciliationState::ConfigStaged);
        assert!(!h.live_path().exists());

        // fixed proxy; the next pass goes live without issuing again
        h.proxy.set_reject(false);
        let report = h.reconciler.run_pass().await;
        assert_eq!(report.applied, Some(ApplyOutcome::Applied));
        assert_eq!(h.state("example.com"), ReconciliationState::Live);
        assert_eq!(h.issuer.calls("example.com"), 1);
    }

    #[tokio::test]
    async fn test_health_failure_reverts() {
        let h = Harness::new(FakeIssuer::new());

        h.reconciler.set_domains([spec("example.com")]).await;
        h.reconciler.run_pass().await;
        let before = h.live();

        h.proxy.set_healthy(false);
        h.reconciler
            .set_domains([spec("example.com"), spec("www.example.com")])
            .await;
        let report = h.reconciler.run_pass().await;

        match report.config_error {
            Some(ConfigFailure::Reload(err)) => {
                assert_eq!(err.kind, ReloadErrorKind::HealthCheckFailed);
            }
            other => panic!("unexpected config result: {other:?}"),
        }
        assert_eq!(h.live(), before);
        assert_eq!(h.state("example.com"), ReconciliationState::Live);
        assert_eq!(h.state("www.example.com"), ReconciliationState::ConfigStaged);
    }

    #[tokio::test]
    async fn test_concurrent_passes_do_not_overlap_per_domain() {
        let mut issuer = FakeIssuer::new();
        // every pass renews
        issuer.window = time::Duration::days(365);
        issuer.delay = Duration::from_millis(30);

        let h = Harness::new(issuer);
        h.reconciler
            .set_domains([spec("a.example.com"), spec("b.example.com")])
            .await;

        let passes = (0..6).map(|_| {
            let reconciler = Arc::clone(&h.reconciler);
            tokio::spawn(async move { reconciler.run_pass().await })
        });
        for pass in future::join_all(passes).await {
            pass.unwrap();
        }

        assert_eq!(h.issuer.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(h.issuer.calls("a.example.com"), 6);
        assert_eq!(h.issuer.calls("b.example.com"), 6);
        assert_eq!(h.state("a.example.com"), ReconciliationState::Live);
        assert_eq!(h.state("b.example.com"), ReconciliationState::Live);

        // renewals reach the proxy, at most once per pass
        let reloads = h.reloads();
        assert!((2..=6).contains(&reloads), "{reloads} reloads");

        // the last apply serves the last stored certificates
        let live = h.live();
        for domain in ["a.example.com", "b.example.com"] {
            let stored = h.store.load(domain).await.unwrap().unwrap();
            assert!(live.contains(&certificate_identity(&stored).unwrap()));
        }
    }

    #[tokio::test]
    async fn test_renewal_reloads_proxy() {
        let mut issuer = FakeIssuer::new();
        // every pass renews
        issuer.window = time::Duration::days(365);

        let h = Harness::new(issuer);
        let old = record("example.com", 70, 20);
        h.store.save(&old).await.unwrap();
        h.reconciler.set_domains([spec("example.com")]).await;

        for pass in 1..=2 {
            let before = h.store.load("example.com").await.unwrap().unwrap();
            let report = h.reconciler.run_pass().await;

            assert_eq!(report.issued, ["example.com"]);
            assert_eq!(report.applied, Some(ApplyOutcome::Applied));
            assert_eq!(h.reloads(), pass);
            assert_eq!(h.state("example.com"), ReconciliationState::Live);

            let renewed = h.store.load("example.com").await.unwrap().unwrap();
            assert_ne!(renewed, before);
            assert!(h.live().contains(&certificate_identity(&renewed).unwrap()));
            assert!(!h.live().contains(&certificate_identity(&before).unwrap()));
        }

        assert_eq!(h.issuer.calls("example.com"), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_issuance() {
        let mut issuer = FakeIssuer::new();
        issuer.delay = Duration::from_secs(30);

        let h = Harness::new(issuer);
        h.reconciler.set_domains([spec("example.com")]).await;

        let reconciler = Arc::clone(&h.reconciler);
        let pass = tokio::spawn(async move { reconciler.run_pass().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.reconciler.shutdown();

        let report = tokio::time::timeout(Duration::from_secs(2), pass)
            .await
            .unwrap()
            .unwrap();

        assert!(report.issued.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(report.applied, None);
        assert!(h.proxy.calls().is_empty());
        assert!(h.reconciler.status_of("example.com").is_some());
    }

    #[tokio::test]
    async fn test_status_snapshot_saved() {
        let issuer = FakeIssuer::new();
        issuer.fail("bad.example.com", AcmeError::network("connection reset"));

        let h = Harness::new(issuer);
        h.reconciler
            .set_domains([spec("good.example.com"), spec("bad.example.com")])
            .await;
        h.reconciler.run_pass().await;

        let snapshot = h.store.load_status().await.unwrap().unwrap();
        assert_eq!(snapshot.domains, h.reconciler.status());

        assert_eq!(
            snapshot.get("good.example.com").unwrap().state,
            ReconciliationState::Live
        );

        let bad = snapshot.get("bad.example.com").unwrap();
        match &bad.state {
            ReconciliationState::Failed(failure) => {
                assert!(failure.retryable);
                assert!(failure.reason.contains("connection reset"));
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(bad.retry_at.is_some());

        h.reconciler.set_domains([spec("good.example.com")]).await;
        let snapshot = h.store.load_status().await.unwrap().unwrap();
        assert!(snapshot.get("bad.example.com").is_none());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let issuer = FakeIssuer::new();
        issuer.fail(
            "bad.example.com",
            AcmeError::challenge_failed("404 on token"),
        );

        let h = Harness::new(issuer);
        h.reconciler
            .set_domains([
                spec("good.example.com"),
                spec("bad.example.com"),
                DomainSpec::new("nobackend.example.com", "", 8080, "ops@example.com"),
            ])
            .await;

        let report = h.reconciler.run_pass().await;

        assert_eq!(report.issued, ["good.example.com"]);
        assert_eq!(report.failed, ["bad.example.com", "nobackend.example.com"]);
        assert_eq!(report.applied, Some(ApplyOutcome::Applied));

        assert_eq!(h.state("good.example.com"), ReconciliationState::Live);
        assert_eq!(
            h.state("bad.example.com"),
            ReconciliationState::failed("challenge failed: 404 on token", false)
        );
        assert!(matches!(
            h.state("nobackend.example.com"),
            ReconciliationState::Failed(Failure { retryable: false, .. })
        ));
        assert_eq!(h.issuer.calls("nobackend.example.com"), 0);

        // the failed domain still gets its plain HTTP block
        let live = h.live();
        assert!(live.contains("# tls: good.example.com\n"));
        assert!(live.contains("# stub: bad.example.com\n"));
        assert!(!live.contains("nobackend"));
    }

    #[tokio::test]
    async fn test_terminal_failure_waits_for_reset() {
        let issuer = FakeIssuer::new();
        issuer.fail("example.com", AcmeError::invalid_domain("caa forbids"));

        let h = Harness::new(issuer);
        h.reconciler.set_domains([spec("example.com")]).await;

        h.reconciler.run_pass().await;
        let report = h.reconciler.run_pass().await;

        assert_eq!(report.skipped, ["example.com"]);
        assert_eq!(h.issuer.calls("example.com"), 1);
        assert_eq!(h.reconciler.next_retry_at(), None);

        h.issuer.succeed("example.com");
        assert!(h.reconciler.reset("example.com"));
        assert!(!h.reconciler.reset("unknown.example.com"));
        assert_eq!(h.state("example.com"), ReconciliationState::Pending);

        h.reconciler.run_pass().await;
        assert_eq!(h.state("example.com"), ReconciliationState::Live);
    }

    #[tokio::test]
    async fn test_changed_spec_resets_failure() {
        let issuer = FakeIssuer::new();
        issuer.fail("example.com", AcmeError::challenge_failed("unauthorized"));

        let h = Harness::new(issuer);
        h.reconciler.set_domains([spec("example.com")]).await;
        h.reconciler.run_pass().await;
        assert!(h.state("example.com").is_failed());

        h.reconciler
            .set_domains([DomainSpec::new(
                "example.com",
                "127.0.0.1",
                9090,
                "ops@example.com",
            )])
            .await;
        assert_eq!(h.state("example.com"), ReconciliationState::Pending);
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off() {
        let issuer = FakeIssuer::new();
        issuer.fail("example.com", AcmeError::network("connection reset"));

        let h = Harness::new(issuer);
        h.reconciler.set_domains([spec("example.com")]).await;

        let report = h.reconciler.run_pass().await;
        assert_eq!(report.failed, ["example.com"]);

        let status = h.reconciler.status_of("example.com").unwrap();
        assert!(matches!(
            status.state,
            ReconciliationState::Failed(Failure { retryable: true, .. })
        ));
        assert!(status.retry_at.is_some());
        assert_eq!(h.reconciler.next_retry_at(), status.retry_at);

        // not due yet
        let report = h.reconciler.run_pass().await;
        assert_eq!(report.skipped, ["example.com"]);
        assert_eq!(h.issuer.calls("example.com"), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        h.issuer.succeed("example.com");

        let report = h.reconciler.run_pass().await;
        assert_eq!(report.issued, ["example.com"]);
        assert_eq!(h.state("example.com"), ReconciliationState::Live);
        assert_eq!(h.reconciler.next_retry_at(), None);
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_tls() {
        let issuer = FakeIssuer::new();
        issuer.fail("example.com", AcmeError::rate_limited("too many certificates"));

        let h = Harness::new(issuer);
        h.store.save(&record("example.com", 70, 20)).await.unwrap();

        h.reconciler.set_domains([spec("example.com")]).await;
        let report = h.reconciler.run_pass().await;

        assert_eq!(report.failed, ["example.com"]);
        assert!(h.state("example.com").is_failed());
        assert!(h.live().contains("# tls: example.com\n"));
        assert!(h.store.load("example.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_removal_deletes_material() {
        let h = Harness::new(FakeIssuer::new());
        h.reconciler
            .set_domains([spec("a.example.com"), spec("b.example.com")])
            .await;
        h.reconciler.run_pass().await;

        h.reconciler.set_domains([spec("a.example.com")]).await;

        assert!(h.reconciler.status_of("b.example.com").is_none());
        assert!(h.store.load("b.example.com").await.unwrap().is_none());
        assert!(h.store.load("a.example.com").await.unwrap().is_some());

        h.reconciler.run_pass().await;
        assert!(!h.live().contains("b.example.com"));
    }

    #[tokio::test]
    async fn test_undeclared_material_pruned() {
        let h = Harness::new(FakeIssuer::new());
        h.store.save(&record("old.example.com", 1, 89)).await.unwrap();

        h.reconciler.set_domains([spec("example.com")]).await;

        assert!(h.store.load("old.example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_removal_cancels_in_flight_issuance() {
        let mut issuer = FakeIssuer::new();
        issuer.delay = Duration::from_secs(30);

        let h = Harness::new(issuer);
        h.reconciler.set_domains([spec("example.com")]).await;

        let reconciler = Arc::clone(&h.reconciler);
        let pass = tokio::spawn(async move { reconciler.run_pass().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.state("example.com"), ReconciliationState::Issuing);

        tokio::time::timeout(Duration::from_secs(2), h.reconciler.set_domains(Vec::new()))
            .await
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), pass)
            .await
            .unwrap()
            .unwrap();

        assert!(report.issued.is_empty());
        assert!(report.failed.is_empty());
        assert!(h.reconciler.status().is_empty());
        assert!(h.store.load_all().await.unwrap().is_empty());
    }
}
