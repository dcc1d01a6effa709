//! Client side of the ACME protocol ([RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555)).
//!
//! # Domain Ownership
//!
//! Before a certificate is issued, the CA wants proof of control over the domain. For ACME, this
//! means proving you control either:
//!
//! - a server answering HTTP requests for that domain (`http-01`);
//! - the DNS server answering name lookups against the domain (`dns-01`).
//!
//! Putting the proof in place is up to the caller; see [`crate::challenge`].
//!
//! # Rate Limits
//!
//! Let's Encrypt uses [rate limits] to ensure the API is not being abused. Use the staging
//! directory ([`LETSENCRYPT_STAGING_URL`]) for development.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

mod api;
mod client;
mod jws;
mod key;
mod transport;

pub use self::{
    api::Problem,
    client::{LETSENCRYPT_STAGING_URL, LETSENCRYPT_URL},
    key::create_p256_key,
};
pub(crate) use self::{
    client::{Account, AuthorizationFailed, Challenge, Directory},
    key::AccountKey,
};
