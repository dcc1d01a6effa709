use std::{collections::VecDeque, sync::Arc};

use eyre::eyre;
use parking_lot::Mutex;
use serde::Serialize;

use super::{
    api::Problem,
    jws::{self, KeyRef},
    key::AccountKey,
};

/// Upper bound of signed requests retried after `badNonce` or flaky JWS verification.
const MAX_ATTEMPTS: usize = 5;

/// Turns non-2xx responses into a [`Problem`].
pub(crate) async fn problem_for_status(res: reqwest::Response) -> Result<reqwest::Response, Problem> {
    // ok responses pass through
    if res.status().is_success() {
        return Ok(res);
    }

    let status = res.status();
    let is_problem_json = res
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    let body = safe_read_body(res).await;

    let problem = if is_problem_json {
        match serde_json::from_str::<Problem>(&body) {
            Ok(mut problem) => {
                problem.status.get_or_insert(status.as_u16());
                problem
            }
            Err(err) => Problem::new(
                "problemJsonFail",
                Some(status.as_u16()),
                format!("Failed to deserialize application/problem+json ({err}) body: {body}"),
            ),
        }
    } else {
        Problem::new(
            "httpReqError",
            Some(status.as_u16()),
            format!("{status} body: {body}"),
        )
    };

    Err(problem)
}

pub(crate) fn expect_header(res: &reqwest::Response, name: &str) -> Result<String, Problem> {
    res.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Problem::new("missingHeader", None, format!("missing header: {name}")))
}

async fn safe_read_body(res: reqwest::Response) -> String {
    // Let's Encrypt sometimes closes the TLS connection abruptly even though the body arrived.
    res.text().await.unwrap_or_default()
}

/// Shared pool of nonces.
#[derive(Debug)]
pub(crate) struct NoncePool {
    http: reqwest::Client,
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub(crate) fn new(http: reqwest::Client, nonce_url: &str) -> Self {
        NoncePool {
            http,
            nonce_url: nonce_url.to_owned(),
            pool: Mutex::new(VecDeque::new()),
        }
    }

    fn extract_nonce(&self, res: &reqwest::Response) {
        let Some(nonce) = res
            .headers()
            .get("replay-nonce")
            .and_then(|value| value.to_str().ok())
        else {
            return;
        };

        log::trace!("Extracting new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce.to_owned());

        if pool.len() > 10 {
            pool.pop_front();
        }
    }

    async fn get_nonce(&self) -> eyre::Result<String> {
        if let Some(nonce) = self.pool.lock().pop_front() {
            log::trace!("Use previous nonce");
            return Ok(nonce);
        }

        log::debug!("Request new nonce");
        let res = self.http.head(&self.nonce_url).send().await?;
        let res = problem_for_status(res).await?;

        Ok(expect_header(&res, "replay-nonce")?)
    }
}

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against the newAccount URL
/// 3. `set_key_id()` from the returned `Location` header.
/// 4. `call()` for all calls after that.
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    http: reqwest::Client,
    account_key: AccountKey,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub(crate) fn new(
        http: reqwest::Client,
        nonce_pool: Arc<NoncePool>,
        account_key: AccountKey,
    ) -> Self {
        Transport {
            http,
            account_key,
            nonce_pool,
        }
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.account_key.set_key_id(kid);
    }

    pub(crate) fn account_key(&self) -> &AccountKey {
        &self.account_key
    }

    /// Makes a call signed with the full public key; only needed for newAccount.
    pub(crate) async fn call_jwk<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, KeyRef::Jwk).await
    }

    /// Makes a call signed with the account URL as key ID.
    pub(crate) async fn call<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        self.do_call(url, body, KeyRef::Kid).await
    }

    async fn do_call<T>(&self, url: &str, body: &T, key_ref: KeyRef) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        // The ACME API may at any point invalidate all nonces. If we detect such an error, we retry
        // with a fresh nonce.
        for attempt in 1..=MAX_ATTEMPTS {
            let nonce = self.nonce_pool.get_nonce().await?;
            let jws = jws::sign(&self.account_key, key_ref, url, nonce, body)?;

            log::debug!("Call endpoint: {url}");

            let res = self
                .http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/jose+json")
                .body(jws)
                .send()
                .await?;

            // Regardless of the request being a success or not, there might be a nonce in the
            // response.
            self.nonce_pool.extract_nonce(&res);

            match problem_for_status(res).await {
                Ok(res) => return Ok(res),

                Err(problem)
                    if attempt < MAX_ATTEMPTS
                        && (problem.is_bad_nonce() || problem.is_jws_verification_error()) =>
                {
                    log::debug!("Retrying on: {problem}");
                }

                Err(problem) => return Err(problem.into()),
            }
        }

        Err(eyre!("no accepted nonce after {MAX_ATTEMPTS} attempts to {url}"))
    }
}
