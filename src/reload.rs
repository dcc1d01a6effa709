//! Applying rendered configuration to the running proxy.
//!
//! This is the only writer of the live configuration file. Every change goes through:
//!
//! 1. write the staged file;
//! 2. run the proxy's validator against it, discarding it on failure;
//! 3. rename it over the live file and signal a graceful reload;
//! 4. re-verify the proxy's health, restoring the last confirmed configuration if it does not
//!    recover.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{eyre, WrapErr as _};
use tokio::{
    fs,
    sync::{Mutex, OwnedMutexGuard},
};

use crate::{
    command,
    error::{ReloadError, ReloadErrorKind},
    render::ProxyConfigArtifact,
    store::write_atomic,
};

/// Controls of the running proxy.
#[async_trait]
pub trait ProxyControl: Send + Sync {
    /// Checks the configuration fragment at `config` without applying it.
    ///
    /// The error carries the validator's diagnostics.
    async fn validate(&self, config: &Path) -> eyre::Result<()>;

    /// Asks the proxy to gracefully load the live configuration.
    async fn reload(&self) -> eyre::Result<()>;

    /// Returns true if the proxy is up and serving.
    async fn is_healthy(&self) -> bool;
}

/// Commands driving an Nginx instance.
///
/// Arguments may contain a `{config}` placeholder, replaced by the file to validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NginxOptions {
    pub validate_command: Vec<String>,
    pub reload_command: Vec<String>,
    pub health_command: Vec<String>,

    /// Requested with a GET instead of running `health_command` when set.
    pub health_url: Option<String>,
}

impl Default for NginxOptions {
    fn default() -> Self {
        let argv = |args: &[&str]| args.iter().map(|arg| (*arg).to_owned()).collect();

        Self {
            validate_command: argv(&["nginx", "-t", "-q", "-c", "{config}"]),
            reload_command: argv(&["systemctl", "reload", "nginx"]),
            health_command: argv(&["systemctl", "is-active", "--quiet", "nginx"]),
            health_url: None,
        }
    }
}

/// [`ProxyControl`] for Nginx.
#[derive(Debug, Clone)]
pub struct NginxControl {
    options: NginxOptions,
    http: reqwest::Client,
}

impl NginxControl {
    pub fn new(options: NginxOptions) -> Self {
        Self {
            options,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProxyControl for NginxControl {
    async fn validate(&self, config: &Path) -> eyre::Result<()> {
        // the fragment belongs in an `http` context; give the validator a complete file
        let config = fs::canonicalize(config)
            .await
            .wrap_err_with(|| format!("resolving {}", config.display()))?;

        let file_name = config
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| eyre!("not a file path: {}", config.display()))?;
        let wrapper = config.with_file_name(format!(".{file_name}.check.conf"));

        let contents = format!("events {{}}\nhttp {{\n    include {};\n}}\n", config.display());
        write_atomic(&wrapper, contents.as_bytes(), false).await?;

        let wrapper_str = wrapper.to_string_lossy().into_owned();
        let res = command::run(
            &self.options.validate_command,
            &[("config", wrapper_str.as_str())],
        )
        .await;

        if let Err(err) = fs::remove_file(&wrapper).await {
            log::warn!("Failed to remove {}: {err}", wrapper.display());
        }

        let out = res?;
        if !out.success {
            return Err(eyre!("{}", out.describe()));
        }

        Ok(())
    }

    async fn reload(&self) -> eyre::Result<()> {
        let out = command::run(&self.options.reload_command, &[]).await?;

        if !out.success {
            return Err(eyre!("{}", out.describe()));
        }

        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        if let Some(url) = &self.options.health_url {
            return match self.http.get(url).send().await {
                Ok(res) => res.status().is_success(),
                Err(err) => {
                    log::debug!("Health check {url} failed: {err}");
                    false
                }
            };
        }

        match command::run(&self.options.health_command, &[]).await {
            Ok(out) => out.success,
            Err(err) => {
                log::debug!("Health command failed: {err:#}");
                false
            }
        }
    }
}

/// Settings of a [`ReloadCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadOptions {
    /// File the proxy loads.
    pub live_path: PathBuf,

    /// Where candidate configuration is written and validated.
    pub staging_path: PathBuf,

    /// How long the proxy may take to come back healthy after a reload.
    pub health_timeout: Duration,

    pub health_interval: Duration,
}

impl ReloadOptions {
    pub fn new(live_path: impl Into<PathBuf>) -> Self {
        let live_path = live_path.into();

        let mut staging_path = live_path.clone().into_os_string();
        staging_path.push(".staged");

        Self {
            live_path,
            staging_path: staging_path.into(),
            health_timeout: Duration::from_secs(10),
            health_interval: Duration::from_millis(500),
        }
    }
}

/// What [`ReloadCoordinator::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The configuration was swapped in and the proxy reloaded healthy.
    Applied,

    /// The configuration is already live; nothing was touched.
    Unchanged,
}

/// Configuration last confirmed healthy.
#[derive(Debug, Default)]
struct Confirmed {
    hash: Option<String>,

    /// Restored when a new configuration fails; `None` removes the live file.
    contents: Option<Vec<u8>>,

    /// Whether `contents` has been taken from the live file found before the first apply.
    seeded: bool,
}

/// Sole writer of the live configuration file.
pub struct ReloadCoordinator {
    options: ReloadOptions,
    control: Arc<dyn ProxyControl>,

    /// Also serializes applies.
    confirmed: Arc<Mutex<Confirmed>>,
}

impl ReloadCoordinator {
    pub fn new(options: ReloadOptions, control: Arc<dyn ProxyControl>) -> Self {
        Self {
            options,
            control,
            confirmed: Arc::new(Mutex::new(Confirmed::default())),
        }
    }

    pub fn options(&self) -> &ReloadOptions {
        &self.options
    }

    /// Hash of the configuration last confirmed live.
    pub async fn confirmed_hash(&self) -> Option<String> {
        self.confirmed.lock().await.hash.clone()
    }

    /// Validates `artifact` and makes it the live configuration.
    ///
    /// Once the staged file has been swapped in, the reload, health check and any revert run to
    /// completion even if the returned future is dropped.
    pub async fn apply(&self, artifact: &ProxyConfigArtifact) -> Result<ApplyOutcome, ReloadError> {
        let mut confirmed = Arc::clone(&self.confirmed).lock_owned().await;

        if confirmed.hash.as_deref() == Some(artifact.hash.as_str()) {
            log::debug!("Configuration {} is already live", short(&artifact.hash));
            return Ok(ApplyOutcome::Unchanged);
        }

        let live = &self.options.live_path;
        let staged = &self.options.staging_path;

        write_atomic(staged, artifact.text.as_bytes(), false)
            .await
            .map_err(|err| ReloadError::new(ReloadErrorKind::Io, format!("{err:#}")))?;

        if let Err(err) = self.control.validate(staged).await {
            log::warn!("Configuration {} rejected: {err:#}", short(&artifact.hash));

            if let Err(err) = fs::remove_file(staged).await {
                log::warn!("Failed to remove {}: {err}", staged.display());
            }

            return Err(ReloadError::new(
                ReloadErrorKind::InvalidConfig,
                format!("{err:#}"),
            ));
        }

        // whatever the proxy was running before the first apply counts as confirmed
        if !confirmed.seeded {
            confirmed.contents = read_previous(live)
                .await
                .map_err(|err| ReloadError::new(ReloadErrorKind::Io, format!("{err:#}")))?;
            confirmed.seeded = true;
        }

        fs::rename(staged, live).await.map_err(|err| {
            ReloadError::new(
                ReloadErrorKind::Io,
                format!("renaming {} to {}: {err}", staged.display(), live.display()),
            )
        })?;

        log::info!(
            "Reloading proxy with configuration {} ({} TLS, {} stub domains)",
            short(&artifact.hash),
            artifact.tls_domains.len(),
            artifact.stub_domains.len()
        );

        let swap = Swap {
            options: self.options.clone(),
            control: Arc::clone(&self.control),
            hash: artifact.hash.clone(),
            contents: artifact.text.clone().into_bytes(),
        };

        match tokio::spawn(swap.finish(confirmed)).await {
            Ok(res) => res,
            Err(err) => Err(ReloadError::new(
                ReloadErrorKind::ReloadSignalFailed,
                format!("reload task ended abnormally: {err}"),
            )),
        }
    }
}

/// A configuration already swapped into the live path.
struct Swap {
    options: ReloadOptions,
    control: Arc<dyn ProxyControl>,
    hash: String,
    contents: Vec<u8>,
}

impl Swap {
    /// Reloads the proxy and waits for it to become healthy, reverting to the last confirmed
    /// configuration if it does not.
    async fn finish(
        self,
        mut confirmed: OwnedMutexGuard<Confirmed>,
    ) -> Result<ApplyOutcome, ReloadError> {
        let signal = self.control.reload().await;

        if let Err(err) = &signal {
            log::warn!(
                "Reload signal for {} failed, checking proxy health: {err:#}",
                short(&self.hash)
            );
        }

        if !self.wait_healthy().await {
            log::error!(
                "Proxy unhealthy after swapping in {}; restoring last confirmed configuration",
                short(&self.hash)
            );

            if let Err(err) = self.restore(confirmed.contents.as_deref()).await {
                log::error!("Failed to restore last confirmed configuration: {err:#}");
            }

            return Err(match signal {
                Err(err) => ReloadError::new(ReloadErrorKind::ReloadSignalFailed, format!("{err:#}")),
                Ok(()) => ReloadError::new(
                    ReloadErrorKind::HealthCheckFailed,
                    format!(
                        "proxy not healthy within {:?} of reload",
                        self.options.health_timeout
                    ),
                ),
            });
        }

        // the proxy still serves the old configuration; the next pass signals again
        if let Err(err) = signal {
            return Err(ReloadError::new(
                ReloadErrorKind::ReloadSignalFailed,
                format!("{err:#}"),
            ));
        }

        confirmed.hash = Some(self.hash);
        confirmed.contents = Some(self.contents);

        Ok(ApplyOutcome::Applied)
    }

    async fn wait_healthy(&self) -> bool {
        let poll = async {
            loop {
                if self.control.is_healthy().await {
                    return;
                }

                tokio::time::sleep(self.options.health_interval).await;
            }
        };

        tokio::time::timeout(self.options.health_timeout, poll)
            .await
            .is_ok()
    }

    async fn restore(&self, previous: Option<&[u8]>) -> eyre::Result<()> {
        let live = &self.options.live_path;

        match previous {
            Some(previous) => write_atomic(live, previous, false).await?,
            None => fs::remove_file(live)
                .await
                .wrap_err_with(|| format!("removing {}", live.display()))?,
        }

        self.control.reload().await
    }
}

async fn read_previous(live: &Path) -> eyre::Result<Option<Vec<u8>>> {
    match fs::read(live).await {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).wrap_err_with(|| format!("reading {}", live.display())),
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
