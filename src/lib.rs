//! Keeps reverse-proxy TLS certificates and configuration in sync with a set of declared domains.
//!
//! Certificates are provisioned from ACME (Automatic Certificate Management Environment)
//! providers such as [Let's Encrypt](https://letsencrypt.org/), following
//! [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555). TLS termination and proxying stay
//! with Nginx; this crate only writes its configuration and asks it to reload.
//!
//! # Components
//!
//! - [`AcmeIssuer`] obtains and renews certificates, proving domain control with `http-01` or
//!   `dns-01` challenges.
//! - [`ConfigRenderer`] turns declared domains and their certificates into Nginx configuration.
//! - [`ReloadCoordinator`] validates rendered configuration, swaps it in and reloads the proxy,
//!   rolling back if the proxy does not come back healthy.
//! - [`Reconciler`] drives every domain through its life cycle, isolating failures per domain.
//! - [`Scheduler`] runs reconciliation passes periodically and on demand.
//!
//! # Domain Ownership
//!
//! For `http-01`, the CA fetches a token from `http://<domain>/.well-known/acme-challenge/` on
//! port 80. Either let the transient challenge listener bind port 80 itself, or bind it elsewhere
//! and set a challenge upstream so the generated Nginx configuration forwards challenge requests
//! to it.
//!
//! # Rate Limits
//!
//! Let's Encrypt uses [rate limits] to ensure the API is not being abused. Rate limited issuance
//! is retried with exponential backoff; use the staging environment while setting up.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

pub mod acme;
pub mod backoff;
pub mod challenge;
mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod issuer;
pub mod reconcile;
pub mod reload;
pub mod render;
pub mod scheduler;
pub mod store;


pub use crate::{
    config::{Config, DomainSource, FileDomainSource},
    domain::{CertificateRecord, DomainSpec, DomainStatus, ReconciliationState, StatusSnapshot},
    error::{AcmeError, AcmeErrorKind, ReloadError, ReloadErrorKind, RenderError, RenderErrorKind},
    issuer::{AcmeIssuer, CertificateIssuer, IssuerOptions},
    reconcile::{PassReport, Reconciler},
    reload::{ApplyOutcome, NginxControl, ProxyControl, ReloadCoordinator},
    render::{ConfigRenderer, ProxyConfigArtifact},
    scheduler::Scheduler,
    store::CertStore,
};
