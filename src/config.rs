//! Daemon configuration and the declared domain set.
//!
//! ```toml
//! [acme]
//! contact_email = "ops@example.com"
//! staging = true
//!
//! [proxy]
//! live_path = "/etc/nginx/conf.d/certsync.conf"
//!
//! [domains."example.com"]
//! backend_address = "127.0.0.1"
//! backend_port = 8080
//! ```

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use eyre::{bail, eyre, WrapErr as _};
use serde::Deserialize;

use crate::{
    acme,
    backoff::Backoff,
    challenge::{ChallengeType, CommandDnsProvider, DnsProvider},
    domain::DomainSpec,
    issuer::IssuerOptions,
    reload::{NginxOptions, ReloadOptions},
    render::RenderOptions,
};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/certsync/certsync.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub acme: AcmeConfig,
    pub proxy: ProxyConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,

    /// File holding the `[domains]` tables instead of this one. Relative paths are resolved
    /// against the directory of the configuration file.
    pub domains_file: Option<PathBuf>,

    pub domains: BTreeMap<String, DomainEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcmeConfig {
    /// Contact for domains that do not name their own.
    pub contact_email: Option<String>,

    /// Use the Let's Encrypt staging environment.
    pub staging: bool,

    /// Overrides the directory selected by `staging`.
    pub directory_url: Option<String>,

    pub challenge: ChallengeType,

    /// Address of the transient `http-01` listener.
    pub http01_bind: SocketAddr,

    pub challenge_timeout_secs: u64,
    pub issuance_timeout_secs: u64,
    pub poll_interval_ms: u64,

    /// `dns-01` hook publishing a TXT record.
    pub dns_set_command: Vec<String>,

    /// `dns-01` hook removing a TXT record.
    pub dns_remove_command: Vec<String>,

    pub dns_propagation_secs: u64,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            contact_email: None,
            staging: false,
            directory_url: None,
            challenge: ChallengeType::Http01,
            http01_bind: SocketAddr::from(([0, 0, 0, 0], 80)),
            challenge_timeout_secs: 90,
            issuance_timeout_secs: 90,
            poll_interval_ms: 2000,
            dns_set_command: Vec::new(),
            dns_remove_command: Vec::new(),
            dns_propagation_secs: 60,
        }
    }
}

impl AcmeConfig {
    pub fn directory_url(&self) -> &str {
        match &self.directory_url {
            Some(url) => url,
            None if self.staging => acme::LETSENCRYPT_STAGING_URL,
            None => acme::LETSENCRYPT_URL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Configuration file included by Nginx.
    pub live_path: PathBuf,

    /// Defaults to the live path with a `.staged` suffix.
    pub staging_path: Option<PathBuf>,

    pub validate_command: Vec<String>,
    pub reload_command: Vec<String>,
    pub health_command: Vec<String>,

    /// Requested instead of running `health_command` when set.
    pub health_url: Option<String>,

    pub health_timeout_secs: u64,

    /// `host:port` Nginx forwards `/.well-known/acme-challenge/` to, when the challenge listener
    /// does not own port 80 itself.
    pub challenge_upstream: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let nginx = NginxOptions::default();

        Self {
            live_path: PathBuf::from("/etc/nginx/conf.d/certsync.conf"),
            staging_path: None,
            validate_command: nginx.validate_command,
            reload_command: nginx.reload_command,
            health_command: nginx.health_command,
            health_url: None,
            health_timeout_secs: 10,
            challenge_upstream: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub cert_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("/var/lib/certsync"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Time between periodic passes.
    pub interval_secs: u64,

    pub renewal_window_days: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 12 * 60 * 60,
            renewal_window_days: 30,
            backoff_base_secs: 1,
            backoff_cap_secs: 60 * 60,
        }
    }
}

/// One `[domains."<name>"]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainEntry {
    pub backend_address: String,
    pub backend_port: u16,

    #[serde(default)]
    pub contact_email: Option<String>,
}

impl Config {
    /// Reads and validates the configuration file at `path`.
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let text = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;

        let mut config = Self::from_toml(&text)
            .wrap_err_with(|| format!("parsing {}", path.display()))?;

        if let Some(domains_file) = &config.domains_file {
            if domains_file.is_relative() {
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                config.domains_file = Some(base.join(domains_file));
            }
        }

        Ok(config)
    }

    pub fn from_toml(text: &str) -> eyre::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        let acme = &self.acme;

        if let Some(contact) = &acme.contact_email {
            check_contact(contact)?;
        }

        if acme.challenge_timeout_secs == 0 || acme.issuance_timeout_secs == 0 {
            bail!("acme timeouts must be positive");
        }
        if acme.poll_interval_ms == 0 {
            bail!("acme.poll_interval_ms must be positive");
        }

        if acme.challenge == ChallengeType::Dns01
            && (acme.dns_set_command.is_empty() || acme.dns_remove_command.is_empty())
        {
            bail!("dns-01 challenges need acme.dns_set_command and acme.dns_remove_command");
        }

        let proxy = &self.proxy;
        for (name, argv) in [
            ("validate_command", &proxy.validate_command),
            ("reload_command", &proxy.reload_command),
            ("health_command", &proxy.health_command),
        ] {
            if argv.is_empty() {
                bail!("proxy.{name} must not be empty");
            }
        }

        if Some(&proxy.live_path) == proxy.staging_path.as_ref() {
            bail!("proxy.staging_path must differ from proxy.live_path");
        }
        if proxy.health_timeout_secs == 0 {
            bail!("proxy.health_timeout_secs must be positive");
        }

        let schedule = &self.schedule;
        if schedule.interval_secs == 0 {
            bail!("schedule.interval_secs must be positive");
        }
        if schedule.renewal_window_days == 0 {
            bail!("schedule.renewal_window_days must be positive");
        }
        if schedule.backoff_base_secs == 0 || schedule.backoff_cap_secs < schedule.backoff_base_secs
        {
            bail!("schedule backoff needs 0 < backoff_base_secs <= backoff_cap_secs");
        }

        if self.domains_file.is_some() && !self.domains.is_empty() {
            bail!("domains are declared both inline and in domains_file");
        }

        domain_specs(&self.domains, acme.contact_email.as_deref())?;

        Ok(())
    }

    pub fn issuer_options(&self) -> IssuerOptions {
        let acme = &self.acme;

        IssuerOptions {
            directory_url: acme.directory_url().to_owned(),
            challenge: acme.challenge,
            challenge_timeout: Duration::from_secs(acme.challenge_timeout_secs),
            issuance_timeout: Duration::from_secs(acme.issuance_timeout_secs),
            poll_interval: Duration::from_millis(acme.poll_interval_ms),
            renewal_window: time::Duration::days(self.schedule.renewal_window_days.into()),
        }
    }

    /// Hook-driven `dns-01` provider, if both hooks are configured.
    pub fn dns_provider(&self) -> Option<Arc<dyn DnsProvider>> {
        let acme = &self.acme;

        if acme.dns_set_command.is_empty() || acme.dns_remove_command.is_empty() {
            return None;
        }

        Some(Arc::new(CommandDnsProvider::new(
            acme.dns_set_command.clone(),
            acme.dns_remove_command.clone(),
            Duration::from_secs(acme.dns_propagation_secs),
        )))
    }

    pub fn nginx_options(&self) -> NginxOptions {
        NginxOptions {
            validate_command: self.proxy.validate_command.clone(),
            reload_command: self.proxy.reload_command.clone(),
            health_command: self.proxy.health_command.clone(),
            health_url: self.proxy.health_url.clone(),
        }
    }

    pub fn reload_options(&self) -> ReloadOptions {
        let mut options = ReloadOptions::new(&self.proxy.live_path);

        if let Some(staging_path) = &self.proxy.staging_path {
            options.staging_path = staging_path.clone();
        }
        options.health_timeout = Duration::from_secs(self.proxy.health_timeout_secs);

        options
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            cert_dir: self.storage.cert_dir.clone(),
            challenge_upstream: self.proxy.challenge_upstream.clone(),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.schedule.backoff_base_secs),
            Duration::from_secs(self.schedule.backoff_cap_secs),
        )
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_secs)
    }

    /// Source of the declared domains: `domains_file` if set, else the configuration file itself.
    pub fn domain_source(&self, config_path: &Path) -> FileDomainSource {
        let path = self
            .domains_file
            .clone()
            .unwrap_or_else(|| config_path.to_owned());

        FileDomainSource::new(path, self.acme.contact_email.clone())
    }
}

fn check_contact(contact: &str) -> eyre::Result<()> {
    let valid = contact
        .split_once('@')
        .is_some_and(|(user, host)| !user.is_empty() && host.contains('.'));

    if !valid || contact.chars().any(|c| c.is_whitespace() || c.is_control()) {
        bail!("invalid contact email {contact:?}");
    }

    Ok(())
}

/// Builds domain specs from `[domains]` tables.
///
/// Domain names are not checked here; a malformed name fails only its own domain during
/// reconciliation.
pub fn domain_specs(
    entries: &BTreeMap<String, DomainEntry>,
    default_contact: Option<&str>,
) -> eyre::Result<Vec<DomainSpec>> {
    entries
        .iter()
        .map(|(domain, entry)| {
            let contact = entry
                .contact_email
                .as_deref()
                .or(default_contact)
                .ok_or_else(|| {
                    eyre!("{domain} has no contact_email and acme.contact_email is not set")
                })?;

            check_contact(contact).wrap_err_with(|| format!("domain {domain}"))?;

            Ok(DomainSpec::new(
                domain.clone(),
                entry.backend_address.clone(),
                entry.backend_port,
                contact,
            ))
        })
        .collect()
}

/// Where the declared domain set comes from.
#[async_trait]
pub trait DomainSource: Send + Sync {
    /// Loads the current declaration.
    async fn load(&self) -> eyre::Result<Vec<DomainSpec>>;
}

/// [`DomainSource`] reading the `[domains]` tables of a TOML file.
///
/// Other tables of the file are ignored, so it reads both the main configuration file and a
/// dedicated domains file.
#[derive(Debug, Clone)]
pub struct FileDomainSource {
    path: PathBuf,
    default_contact: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DomainTables {
    #[serde(default)]
    domains: BTreeMap<String, DomainEntry>,
}

impl FileDomainSource {
    pub fn new(path: impl Into<PathBuf>, default_contact: Option<String>) -> Self {
        Self {
            path: path.into(),
            default_contact,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DomainSource for FileDomainSource {
    async fn load(&self) -> eyre::Result<Vec<DomainSpec>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .wrap_err_with(|| format!("reading {}", self.path.display()))?;

        let tables: DomainTables = toml::from_str(&text)
            .wrap_err_with(|| format!("parsing {}", self.path.display()))?;

        let specs = domain_specs(&tables.domains, self.default_contact.as_deref())?;
        log::debug!("Loaded {} domains from {}", specs.len(), self.path.display());

        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [acme]
        contact_email = "ops@example.com"
        staging = true
        http01_bind = "127.0.0.1:8402"

        [proxy]
        live_path = "/tmp/certsync.conf"
        challenge_upstream = "127.0.0.1:8402"

        [storage]
        cert_dir = "/tmp/certsync"

        [schedule]
        interval_secs = 3600

        [domains."example.com"]
        backend_address = "127.0.0.1"
        backend_port = 8080

        [domains."api.example.com"]
        backend_address = "10.0.0.2"
        backend_port = 9000
        contact_email = "api@example.com"
    "#;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.acme.directory_url(), acme::LETSENCRYPT_URL);
        assert_eq!(config.acme.http01_bind.port(), 80);
        assert_eq!(config.interval(), Duration::from_secs(43200));

        let reload = config.reload_options();
        assert_eq!(reload.health_timeout, Duration::from_secs(10));
        assert_eq!(
            reload.staging_path,
            Path::new("/etc/nginx/conf.d/certsync.conf.staged")
        );

        let issuer = config.issuer_options();
        assert_eq!(issuer.challenge_timeout, Duration::from_secs(90));
        assert_eq!(issuer.renewal_window, time::Duration::days(30));
        assert!(config.dns_provider().is_none());
    }

    #[test]
    fn test_example() {
        let config = Config::from_toml(EXAMPLE).unwrap();

        assert_eq!(config.acme.directory_url(), acme::LETSENCRYPT_STAGING_URL);
        assert_eq!(
            config.render_options().challenge_upstream.as_deref(),
            Some("127.0.0.1:8402")
        );

        let specs = domain_specs(&config.domains, config.acme.contact_email.as_deref()).unwrap();
        assert_eq!(
            specs,
            [
                DomainSpec::new("api.example.com", "10.0.0.2", 9000, "api@example.com"),
                DomainSpec::new("example.com", "127.0.0.1", 8080, "ops@example.com"),
            ]
        );
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = Config::from_toml("[proxy]\nlive_pth = \"/tmp/x\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("live_pth"));

        let err = Config::from_toml(
            "[domains.\"example.com\"]\nbackend_address = \"127.0.0.1\"\nbackend_port = 1\nport = 2\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("port"));
    }

    #[test]
    fn test_validation() {
        // no contact anywhere
        let res = Config::from_toml(
            "[domains.\"example.com\"]\nbackend_address = \"127.0.0.1\"\nbackend_port = 8080\n",
        );
        assert!(res.is_err());

        assert!(Config::from_toml("[acme]\ncontact_email = \"nobody\"\n").is_err());
        assert!(Config::from_toml("[acme]\nchallenge = \"dns-01\"\n").is_err());
        assert!(Config::from_toml("[schedule]\ninterval_secs = 0\n").is_err());
        assert!(
            Config::from_toml("[schedule]\nbackoff_base_secs = 10\nbackoff_cap_secs = 5\n")
                .is_err()
        );
        assert!(Config::from_toml("[proxy]\nreload_command = []\n").is_err());

        let dns = Config::from_toml(
            r#"
            [acme]
            challenge = "dns-01"
            dns_set_command = ["/usr/local/bin/dns-hook", "set", "{name}", "{value}"]
            dns_remove_command = ["/usr/local/bin/dns-hook", "remove", "{name}", "{value}"]
            "#,
        )
        .unwrap();
        assert!(dns.dns_provider().is_some());
    }

    #[test]
    fn test_domains_file_resolved_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certsync.toml");
        std::fs::write(&path, "domains_file = \"domains.toml\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.domains_file, Some(dir.path().join("domains.toml")));

        let source = config.domain_source(&path);
        assert_eq!(source.path(), dir.path().join("domains.toml"));
    }

    #[tokio::test]
    async fn test_file_domain_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certsync.toml");
        std::fs::write(&path, EXAMPLE).unwrap();

        let source = FileDomainSource::new(&path, Some("ops@example.com".to_owned()));
        assert_eq!(source.load().await.unwrap().len(), 2);

        // edits are picked up on the next load
        std::fs::write(
            &path,
            "[domains.\"example.com\"]\nbackend_address = \"127.0.0.1\"\nbackend_port = 8081\n",
        )
        .unwrap();
        assert_eq!(
            source.load().await.unwrap(),
            [DomainSpec::new("example.com", "127.0.0.1", 8081, "ops@example.com")]
        );

        std::fs::write(&path, "[domains.\"example.com\"]\nbackend_port = 8081\n").unwrap();
        assert!(source.load().await.is_err());
    }
}
