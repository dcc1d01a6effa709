//! Putting ACME challenge proofs in place.
//!
//! Both kinds of proof are scoped: registering one returns a guard, and dropping the guard takes
//! the proof down again. This holds on every exit path of an issuance, including a timeout or the
//! cancellation of the future that holds the guard.

use std::{
    collections::HashMap,
    convert::Infallible,
    fmt,
    future::ready,
    io,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};

use actix_http::{body::BoxBody, HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use async_trait::async_trait;
use eyre::{eyre, WrapErr as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::command;

/// Path under which `http-01` proofs are served.
pub const HTTP01_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// How long a bind is retried while a previous listener on the same address shuts down.
const REBIND_ATTEMPTS: u32 = 20;
const REBIND_DELAY: Duration = Duration::from_millis(50);

/// Kind of proof of domain control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChallengeType {
    /// Serve the key authorization over plain HTTP.
    #[default]
    #[serde(rename = "http-01")]
    Http01,

    /// Publish a digest of the key authorization in a `_acme-challenge` TXT record.
    #[serde(rename = "dns-01")]
    Dns01,
}

impl ChallengeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Tokens = Arc<Mutex<HashMap<String, String>>>;

struct Listener {
    handle: ServerHandle,
    local_addr: SocketAddr,
}

struct ResponderInner {
    bind: SocketAddr,
    tokens: Tokens,
    listener: Mutex<Option<Listener>>,
}

/// Transient HTTP listener answering `http-01` challenges.
///
/// Concurrent issuances share one listener. It is bound when the first token is registered and
/// stopped when the last [`Http01Guard`] is dropped.
#[derive(Clone)]
pub struct Http01Responder {
    inner: Arc<ResponderInner>,
}

impl fmt::Debug for Http01Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http01Responder")
            .field("bind", &self.inner.bind)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl Http01Responder {
    pub fn new(bind: SocketAddr) -> Self {
        Http01Responder {
            inner: Arc::new(ResponderInner {
                bind,
                tokens: Arc::new(Mutex::new(HashMap::new())),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Address the listener is bound to, if it is currently running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .lock()
            .as_ref()
            .map(|listener| listener.local_addr)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    /// Serves `key_authorization` for `token` until the returned guard is dropped.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn register(&self, token: &str, key_authorization: &str) -> eyre::Result<Http01Guard> {
        let mut attempt = 1;

        loop {
            match self.try_register(token, key_authorization) {
                Ok(guard) => return Ok(guard),

                // a listener stopped a moment ago may still hold the address
                Err(err) if err.kind() == io::ErrorKind::AddrInUse && attempt < REBIND_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(REBIND_DELAY).await;
                }

                Err(err) => {
                    return Err(err).wrap_err_with(|| {
                        format!("binding http-01 listener on {}", self.inner.bind)
                    })
                }
            }
        }
    }

    fn try_register(&self, token: &str, key_authorization: &str) -> io::Result<Http01Guard> {
        let mut listener = self.inner.listener.lock();

        if listener.is_none() {
            *listener = Some(self.start()?);
        }

        self.inner
            .tokens
            .lock()
            .insert(token.to_owned(), key_authorization.to_owned());

        log::debug!("Serving http-01 token {token}");

        Ok(Http01Guard {
            responder: self.clone(),
            token: token.to_owned(),
        })
    }

    fn start(&self) -> io::Result<Listener> {
        let lst = TcpListener::bind(self.inner.bind)?;
        let local_addr = lst.local_addr()?;

        let tokens = Arc::clone(&self.inner.tokens);

        let server = Server::build()
            .listen("http-01", lst, move || {
                let tokens = Arc::clone(&tokens);

                HttpService::build()
                    .finish(move |req: Request| {
                        ready(Ok::<_, Infallible>(serve_token(&req, &tokens)))
                    })
                    .tcp()
            })?
            .workers(1)
            .disable_signals()
            .run();

        let handle = server.handle();
        tokio::spawn(server);

        log::info!("http-01 listener started on {local_addr}");

        Ok(Listener { handle, local_addr })
    }

    fn release(&self, token: &str) {
        let mut listener = self.inner.listener.lock();

        let mut tokens = self.inner.tokens.lock();
        tokens.remove(token);

        if tokens.is_empty() {
            if let Some(listener) = listener.take() {
                log::info!("http-01 listener on {} stopped", listener.local_addr);
                drop(listener.handle.stop(false));
            }
        }
    }
}

fn serve_token(req: &Request, tokens: &Mutex<HashMap<String, String>>) -> Response<BoxBody> {
    let key_auth = (*req.method() == Method::GET)
        .then(|| req.path().strip_prefix(HTTP01_PATH_PREFIX))
        .flatten()
        .and_then(|token| tokens.lock().get(token).cloned());

    match key_auth {
        Some(key_auth) => Response::build(StatusCode::OK)
            .insert_header(("Content-Type", "application/octet-stream"))
            .body(key_auth)
            .map_into_boxed_body(),

        None => Response::build(StatusCode::NOT_FOUND)
            .finish()
            .map_into_boxed_body(),
    }
}

/// Keeps one `http-01` token served; dropping it removes the token.
#[must_use = "the token is withdrawn when the guard is dropped"]
pub struct Http01Guard {
    responder: Http01Responder,
    token: String,
}

impl Drop for Http01Guard {
    fn drop(&mut self) {
        log::debug!("Withdrawing http-01 token {}", self.token);
        self.responder.release(&self.token);
    }
}

/// Publishes and withdraws `dns-01` TXT records.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Creates the TXT record `name` with `value`.
    async fn set_txt(&self, name: &str, value: &str) -> eyre::Result<()>;

    /// Removes the TXT record `name` with `value`.
    async fn remove_txt(&self, name: &str, value: &str) -> eyre::Result<()>;

    /// Time for a new record to become visible to the CA's resolvers.
    fn propagation_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Name of the TXT record proving control over `domain`.
pub fn dns01_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_end_matches('.'))
}

/// Publishes the `dns-01` proof of `domain` and waits for it to propagate.
///
/// The record is removed when the returned guard is dropped.
pub async fn publish_dns01(
    provider: Arc<dyn DnsProvider>,
    domain: &str,
    value: &str,
) -> eyre::Result<Dns01Guard> {
    let name = dns01_record_name(domain);

    provider
        .set_txt(&name, value)
        .await
        .wrap_err_with(|| format!("publishing TXT record {name}"))?;

    // from here on the record is withdrawn on every exit path
    let guard = Dns01Guard {
        provider: Arc::clone(&provider),
        name,
        value: value.to_owned(),
    };

    let delay = provider.propagation_delay();
    if !delay.is_zero() {
        log::debug!("Waiting {delay:?} for {} to propagate", guard.name);
        tokio::time::sleep(delay).await;
    }

    Ok(guard)
}

/// Keeps one `dns-01` TXT record published; dropping it removes the record.
#[must_use = "the TXT record is removed when the guard is dropped"]
pub struct Dns01Guard {
    provider: Arc<dyn DnsProvider>,
    name: String,
    value: String,
}

impl Drop for Dns01Guard {
    fn drop(&mut self) {
        let provider = Arc::clone(&self.provider);
        let name = std::mem::take(&mut self.name);
        let value = std::mem::take(&mut self.value);

        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime to remove TXT record {name}");
            return;
        };

        rt.spawn(async move {
            match provider.remove_txt(&name, &value).await {
                Ok(()) => log::debug!("Removed TXT record {name}"),
                Err(err) => log::warn!("Failed to remove TXT record {name}: {err:#}"),
            }
        });
    }
}

/// [`DnsProvider`] running operator hook commands.
///
/// Arguments may contain `{name}`, `{value}` and `{domain}` placeholders; the same values are
/// exported as `CERTSYNC_NAME`, `CERTSYNC_VALUE` and `CERTSYNC_DOMAIN`.
#[derive(Debug, Clone)]
pub struct CommandDnsProvider {
    set_command: Vec<String>,
    remove_command: Vec<String>,
    propagation_delay: Duration,
}

impl CommandDnsProvider {
    pub fn new(
        set_command: Vec<String>,
        remove_command: Vec<String>,
        propagation_delay: Duration,
    ) -> Self {
        Self {
            set_command,
            remove_command,
            propagation_delay,
        }
    }

    async fn run(&self, argv: &[String], name: &str, value: &str) -> eyre::Result<()> {
        let domain = name.trim_start_matches("_acme-challenge.");

        let out = command::run(
            argv,
            &[("name", name), ("value", value), ("domain", domain)],
        )
        .await?;

        if !out.success {
            return Err(eyre!("DNS hook failed with {}", out.describe()));
        }

        Ok(())
    }
}

#[async_trait]
impl DnsProvider for CommandDnsProvider {
    async fn set_txt(&self, name: &str, value: &str) -> eyre::Result<()> {
        self.run(&self.set_command, name, value).await
    }

    async fn remove_txt(&self, name: &str, value: &str) -> eyre::Result<()> {
        self.run(&self.remove_command, name, value).await
    }

    fn propagation_delay(&self) -> Duration {
        self.propagation_delay
    }
}
