//! certsync - keeps Nginx TLS certificates and configuration in sync with declared domains.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use certsync::{
    challenge::Http01Responder, AcmeIssuer, CertStore, Config, ConfigRenderer, DomainSource as _,
    DomainStatus, NginxControl, PassReport, Reconciler, ReconciliationState, ReloadCoordinator,
    Scheduler,
};
use clap::{Parser, Subcommand};
use eyre::{bail, WrapErr as _};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "certsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        env = "CERTSYNC_CONFIG",
        default_value = certsync::config::DEFAULT_CONFIG_PATH,
        global = true
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile periodically until stopped (default)
    ///
    /// SIGHUP clears failed domains and starts a pass immediately.
    Run,

    /// Run a single reconciliation pass and exit
    Once,

    /// Print the proxy configuration for the declared domains and stored certificates
    Render,

    /// Show stored certificates of the declared domains and their last recorded state
    Status,

    /// Validate the configuration and declared domains and exit
    Check,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .wrap_err_with(|| format!("loading configuration {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config, config).await,
        Commands::Once => once(&cli.config, config).await,
        Commands::Render => render(&cli.config, &config).await,
        Commands::Status => status(&cli.config, &config).await,
        Commands::Check => check(&cli.config, &config).await,
    }
}

fn reconciler(config: &Config) -> Reconciler {
    let store = CertStore::new(&config.storage.cert_dir);

    let mut issuer = AcmeIssuer::new(
        config.issuer_options(),
        store.clone(),
        Http01Responder::new(config.acme.http01_bind),
    );
    if let Some(dns) = config.dns_provider() {
        issuer = issuer.with_dns_provider(dns);
    }

    let control = Arc::new(NginxControl::new(config.nginx_options()));
    let coordinator = ReloadCoordinator::new(config.reload_options(), control);

    Reconciler::new(
        Arc::new(issuer),
        ConfigRenderer::new(config.render_options()),
        coordinator,
        store,
    )
    .with_backoff(config.backoff())
}

fn scheduler(config_path: &Path, config: &Config) -> Scheduler {
    Scheduler::new(
        Arc::new(reconciler(config)),
        Arc::new(config.domain_source(config_path)),
        config.interval(),
    )
}

async fn run(config_path: &Path, config: Config) -> eyre::Result<()> {
    log::info!(
        "Starting certsync against {} ({} challenges)",
        config.acme.directory_url(),
        config.acme.challenge
    );

    let scheduler = scheduler(config_path, &config);
    let shutdown = CancellationToken::new();

    handle_signals(&scheduler, shutdown.clone())?;
    scheduler.run(shutdown).await;

    Ok(())
}

#[cfg(unix)]
fn handle_signals(scheduler: &Scheduler, shutdown: CancellationToken) -> eyre::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let trigger = scheduler.trigger();
    let reconciler = Arc::clone(scheduler.reconciler());

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    log::info!("SIGHUP received, clearing failures and starting a pass");

                    for status in reconciler.status() {
                        if status.state.is_failed() {
                            reconciler.reset(&status.domain);
                        }
                    }
                    trigger.notify_one();
                }
                _ = terminate.recv() => {
                    log::info!("SIGTERM received, shutting down");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted, shutting down");
                    break;
                }
            }
        }

        shutdown.cancel();
    });

    Ok(())
}

#[cfg(not(unix))]
fn handle_signals(_scheduler: &Scheduler, shutdown: CancellationToken) -> eyre::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, shutting down");
        }
        shutdown.cancel();
    });

    Ok(())
}

async fn once(config_path: &Path, config: Config) -> eyre::Result<()> {
    let report = scheduler(config_path, &config).run_once().await?;
    print_report(&report);

    if !report.is_clean() {
        bail!("pass finished with failures");
    }

    Ok(())
}

fn print_report(report: &PassReport) {
    for domain in &report.issued {
        println!("{domain}: issued");
    }
    for domain in &report.unchanged {
        println!("{domain}: unchanged");
    }
    for domain in &report.failed {
        println!("{domain}: failed");
    }
    for domain in &report.skipped {
        println!("{domain}: skipped");
    }

    match (&report.applied, &report.config_error) {
        (_, Some(err)) => println!("proxy configuration: {err}"),
        (Some(outcome), None) => println!("proxy configuration: {outcome:?}"),
        (None, None) => {}
    }
}

async fn render(config_path: &Path, config: &Config) -> eyre::Result<()> {
    let specs = config.domain_source(config_path).load().await?;
    let store = CertStore::new(&config.storage.cert_dir);

    let mut certs = store.load_all().await?;
    certs.retain(|domain, _| specs.iter().any(|spec| &spec.domain == domain));

    let artifact = ConfigRenderer::new(config.render_options()).render(
        &specs,
        &certs,
        OffsetDateTime::now_utc(),
    )?;

    print!("{}", artifact.text);
    Ok(())
}

async fn status(config_path: &Path, config: &Config) -> eyre::Result<()> {
    let specs = config.domain_source(config_path).load().await?;
    let store = CertStore::new(&config.storage.cert_dir);
    let window = config.issuer_options().renewal_window;
    let now = OffsetDateTime::now_utc();

    let snapshot = match store.load_status().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            log::warn!("Ignoring unreadable status: {err:#}");
            None
        }
    };

    match &snapshot {
        Some(snapshot) => println!("state as of {}", snapshot.written_at.format(&Rfc3339)?),
        None => println!("no recorded state; has the daemon run?"),
    }

    for spec in &specs {
        let line = match store.load(&spec.domain).await {
            Ok(Some(cert)) => {
                let state = if cert.is_expired(now) {
                    "expired"
                } else if cert.is_renewable(now, window) {
                    "due for renewal"
                } else {
                    "valid"
                };

                format!(
                    "{state}, expires {} ({} days left), issued by {}",
                    cert.expires_at.format(&Rfc3339)?,
                    cert.valid_days_left(now),
                    cert.issuer
                )
            }
            Ok(None) => "no certificate".to_owned(),
            Err(err) => format!("unreadable: {err:#}"),
        };

        println!("{}: {line}", spec.domain);

        if let Some(status) = snapshot.as_ref().and_then(|s| s.get(&spec.domain)) {
            println!("    {}", describe(status)?);
        }
    }

    Ok(())
}

fn describe(status: &DomainStatus) -> eyre::Result<String> {
    let mut line = status.state.to_string();

    if let ReconciliationState::Failed(failure) = &status.state {
        match status.retry_at {
            Some(retry_at) if failure.retryable => {
                line.push_str(&format!(", next attempt at {}", retry_at.format(&Rfc3339)?));
            }
            _ if !failure.retryable => line.push_str(", waiting for a reset (SIGHUP)"),
            _ => {}
        }
    }

    Ok(line)
}

async fn check(config_path: &Path, config: &Config) -> eyre::Result<()> {
    let source = config.domain_source(config_path);
    let specs = source.load().await?;
    let renderer = ConfigRenderer::new(config.render_options());

    let mut invalid = 0;
    for spec in &specs {
        if let Err(err) = renderer.check(spec) {
            println!("{err}");
            invalid += 1;
        }
    }

    if invalid > 0 {
        bail!("{invalid} of {} declared domains are invalid", specs.len());
    }

    println!(
        "certsync: configuration {} is valid ({} domains from {})",
        config_path.display(),
        specs.len(),
        source.path().display()
    );

    Ok(())
}
