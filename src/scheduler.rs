//! Periodic and on-demand reconciliation passes.

use std::{pin::pin, sync::Arc, time::Duration};

use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{
    config::DomainSource,
    reconcile::{PassReport, Reconciler},
};

/// Runs reconciliation passes until shut down.
///
/// A pass starts when the interval elapses, when the earliest pending retry becomes due, or when
/// [`Scheduler::trigger`] is notified. The declaration is reloaded before every pass.
pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    source: Arc<dyn DomainSource>,
    interval: Duration,
    trigger: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        reconciler: Arc<Reconciler>,
        source: Arc<dyn DomainSource>,
        interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            source,
            interval,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Handle requesting an immediate pass.
    ///
    /// A notification arriving during a pass starts another one right after it.
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Loads the declaration and runs a single pass.
    pub async fn run_once(&self) -> eyre::Result<PassReport> {
        let specs = self.source.load().await?;
        self.reconciler.set_domains(specs).await;

        Ok(self.reconciler.run_pass().await)
    }

    /// Runs passes until `shutdown` fires.
    ///
    /// If the declaration cannot be loaded, the pass runs against the previous one. Shutdown
    /// during a pass cancels its certificate work but lets an apply in progress finish, so a
    /// swapped-in configuration is always confirmed or reverted.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            match self.source.load().await {
                Ok(specs) => self.reconciler.set_domains(specs).await,
                Err(err) => {
                    log::error!("Loading declared domains failed, keeping previous set: {err:#}")
                }
            }

            let mut pass = pin!(self.reconciler.run_pass());

            let finished = tokio::select! {
                report = &mut pass => Some(report),
                _ = shutdown.cancelled() => None,
            };

            let report = match finished {
                Some(report) => report,
                None => {
                    log::info!("Shutting down, waiting for the current pass to wind down");
                    self.reconciler.shutdown();
                    pass.await
                }
            };
            log_report(&report);

            if shutdown.is_cancelled() {
                break;
            }

            let delay = wake_delay(
                OffsetDateTime::now_utc(),
                self.interval,
                self.reconciler.next_retry_at(),
            );
            log::debug!("Next pass in {delay:?}");

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.trigger.notified() => log::info!("Pass requested"),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        log::info!("Scheduler stopped");
    }
}

/// Time until the next pass: the interval, or sooner if a retry becomes due first.
fn wake_delay(
    now: OffsetDateTime,
    interval: Duration,
    next_retry: Option<OffsetDateTime>,
) -> Duration {
    let Some(retry_at) = next_retry else {
        return interval;
    };

    let until_retry = Duration::try_from(retry_at - now).unwrap_or(Duration::ZERO);
    until_retry.min(interval)
}

fn log_report(report: &PassReport) {
    log::info!(
        "Pass finished: {} issued, {} unchanged, {} failed, {} skipped",
        report.issued.len(),
        report.unchanged.len(),
        report.failed.len(),
        report.skipped.len()
    );

    if let Some(err) = &report.config_error {
        log::error!("Proxy configuration not applied: {err}");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        domain::{DomainSpec, ReconciliationState},
        test::{fake_reconciler, FakeIssuer, FakeProxy},
    };

    #[derive(Default)]
    struct FakeSource {
        specs: Mutex<Option<Vec<DomainSpec>>>,
        loads: Mutex<usize>,
    }

    impl FakeSource {
        fn set(&self, specs: Option<Vec<DomainSpec>>) {
            *self.specs.lock() = specs;
        }

        fn loads(&self) -> usize {
            *self.loads.lock()
        }
    }

    #[async_trait]
    impl DomainSource for FakeSource {
        async fn load(&self) -> eyre::Result<Vec<DomainSpec>> {
            *self.loads.lock() += 1;

            self.specs
                .lock()
                .clone()
                .ok_or_else(|| eyre::eyre!("domains.toml: expected `=`"))
        }
    }

    fn spec(domain: &str) -> DomainSpec {
        DomainSpec::new(domain, "127.0.0.1", 8080, "ops@example.com")
    }

    async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("timed out waiting for {what}");
    }

    #[test]
    fn test_wake_delay() {
        let now = OffsetDateTime::now_utc();
        let interval = Duration::from_secs(12 * 60 * 60);

        assert_eq!(wake_delay(now, interval, None), interval);
        assert_eq!(
            wake_delay(now, interval, Some(now + time::Duration::seconds(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            wake_delay(now, interval, Some(now + time::Duration::days(2))),
            interval
        );
        assert_eq!(
            wake_delay(now, interval, Some(now - time::Duration::seconds(5))),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = fake_reconciler(
            dir.path(),
            Arc::new(FakeIssuer::new()),
            Arc::new(FakeProxy::default()),
        );

        let source = Arc::new(FakeSource::default());
        source.set(Some(vec![spec("example.com")]));

        let scheduler = Scheduler::new(Arc::new(reconciler), source.clone(), Duration::from_secs(60));
        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.issued, ["example.com"]);

        source.set(None);
        assert!(scheduler.run_once().await.is_err());
    }

    #[tokio::test]
    async fn test_triggered_passes_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(fake_reconciler(
            dir.path(),
            Arc::new(FakeIssuer::new()),
            Arc::new(FakeProxy::default()),
        ));

        let source = Arc::new(FakeSource::default());
        source.set(Some(vec![spec("example.com")]));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&reconciler),
            source.clone(),
            Duration::from_secs(3600),
        ));
        let trigger = scheduler.trigger();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });

        wait_for("first pass", || {
            reconciler
                .status_of("example.com")
                .is_some_and(|status| status.state == ReconciliationState::Live)
        })
        .await;
        assert_eq!(source.loads(), 1);

        // a broken declaration keeps the previous domains
        source.set(None);
        trigger.notify_one();
        wait_for("second load", || source.loads() == 2).await;
        assert!(reconciler.status_of("example.com").is_some());

        source.set(Some(vec![spec("example.com"), spec("www.example.com")]));
        trigger.notify_one();
        wait_for("new domain live", || {
            reconciler
                .status_of("www.example.com")
                .is_some_and(|status| status.state == ReconciliationState::Live)
        })
        .await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_health_wait_still_reverts() {
        let dir = tempfile::tempdir().unwrap();
        let proxy = Arc::new(FakeProxy::default());
        let reconciler = Arc::new(fake_reconciler(
            dir.path(),
            Arc::new(FakeIssuer::new()),
            proxy.clone(),
        ));

        let source = Arc::new(FakeSource::default());
        source.set(Some(vec![spec("example.com")]));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&reconciler),
            source.clone(),
            Duration::from_secs(3600),
        ));
        let trigger = scheduler.trigger();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });

        wait_for("first pass", || {
            reconciler
                .status_of("example.com")
                .is_some_and(|status| status.state == ReconciliationState::Live)
        })
        .await;
        let live_path = dir.path().join("certsync.conf");
        let confirmed = std::fs::read_to_string(&live_path).unwrap();

        proxy.set_healthy(false);
        source.set(Some(vec![spec("example.com"), spec("www.example.com")]));
        trigger.notify_one();

        // the new file is swapped in and the proxy reloaded; health is being awaited
        wait_for("second reload", || proxy.calls().len() == 4).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            proxy.calls(),
            ["validate", "reload", "validate", "reload", "reload"]
        );
        assert_eq!(std::fs::read_to_string(&live_path).unwrap(), confirmed);
        assert_eq!(
            reconciler.status_of("www.example.com").unwrap().state,
            ReconciliationState::ConfigStaged
        );
    }
}
