//! Rendering the reverse proxy configuration.
//!
//! The output is an Nginx `http` context fragment. It contains, per declared domain:
//!
//! - an `upstream` pointing at the backend;
//! - a port 80 `server` block that redirects to HTTPS once a certificate exists and proxies
//!   plain HTTP until then;
//! - a port 443 `server` block terminating TLS, only while a non-expired certificate exists.
//!
//! A comment header lists the TLS and stub domains and identifies every served certificate, so a
//! renewal yields a new artifact even though the file paths it references stay the same.
//!
//! Rendering is pure: identical input gives byte-identical output.

use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Write as _},
    path::PathBuf,
};

use sha2::{Digest as _, Sha256};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    challenge::HTTP01_PATH_PREFIX,
    domain::{is_valid_domain, CertificateRecord, DomainSpec},
    error::RenderError,
    store::CertPaths,
};

/// Characters that would end or escape an Nginx directive argument.
const FORBIDDEN: &[char] = &[';', '{', '}', '"', '\'', '#', '$', '\\'];

/// Settings of a [`ConfigRenderer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Storage root of the certificate store, as seen by the proxy.
    pub cert_dir: PathBuf,

    /// `host:port` of the `http-01` challenge listener. When set, every port 80 block passes
    /// `/.well-known/acme-challenge/` through to it.
    pub challenge_upstream: Option<String>,
}

/// Rendered proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfigArtifact {
    pub text: String,

    /// Hex encoded SHA-256 of `text`.
    pub hash: String,

    /// Domains served over TLS, sorted.
    pub tls_domains: Vec<String>,

    /// Domains served over plain HTTP only, sorted.
    pub stub_domains: Vec<String>,
}

impl ProxyConfigArtifact {
    fn new(text: String, tls_domains: Vec<String>, stub_domains: Vec<String>) -> Self {
        let hash = Sha256::digest(text.as_bytes())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        Self {
            text,
            hash,
            tls_domains,
            stub_domains,
        }
    }
}

/// Renders [`ProxyConfigArtifact`]s.
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    options: RenderOptions,
}

impl ConfigRenderer {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Checks that `spec` renders to well-formed configuration.
    pub fn check(&self, spec: &DomainSpec) -> Result<(), RenderError> {
        let domain = &spec.domain;

        if !is_valid_domain(domain) {
            return Err(RenderError::template(
                domain,
                "server name is not a fully qualified DNS name",
            ));
        }

        let address = spec.backend_address.trim();

        if address.is_empty() {
            return Err(RenderError::missing_backend(domain, "backend address is empty"));
        }

        if spec.backend_port == 0 {
            return Err(RenderError::missing_backend(domain, "backend port is 0"));
        }

        if spec.backend_address.contains(char::is_whitespace)
            || spec.backend_address.contains(FORBIDDEN)
        {
            return Err(RenderError::template(
                domain,
                format!("backend address {:?} contains reserved characters", spec.backend_address),
            ));
        }

        let paths = CertPaths::new(&self.options.cert_dir, domain);
        for path in [&paths.fullchain, &paths.privkey] {
            match path.to_str() {
                Some(path) if !path.contains(char::is_whitespace) && !path.contains(FORBIDDEN) => {}
                _ => {
                    return Err(RenderError::template(
                        domain,
                        format!("certificate path {} is not usable in config", path.display()),
                    ))
                }
            }
        }

        Ok(())
    }

    /// Renders the configuration for `specs`.
    ///
    /// A domain gets a TLS block only if `certs` holds a certificate for it that has not expired
    /// at `now`.
    pub fn render(
        &self,
        specs: &[DomainSpec],
        certs: &HashMap<String, CertificateRecord>,
        now: OffsetDateTime,
    ) -> Result<ProxyConfigArtifact, RenderError> {
        let mut specs = specs.iter().collect::<Vec<_>>();
        specs.sort_by(|a, b| a.domain.cmp(&b.domain));

        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.domain.as_str()) {
                return Err(RenderError::template(&spec.domain, "domain is declared twice"));
            }

            self.check(spec)?;
        }

        let mut tls_domains = Vec::new();
        let mut stub_domains = Vec::new();
        let mut served = Vec::new();

        let mut text = String::new();

        for spec in &specs {
            let cert = certs
                .get(&spec.domain)
                .filter(|cert| cert.domain == spec.domain && !cert.is_expired(now));

            match cert {
                Some(cert) => {
                    tls_domains.push(spec.domain.clone());
                    served.push(certificate_identity(cert)?);
                }
                None => stub_domains.push(spec.domain.clone()),
            }

            self.write_domain(&mut text, spec, cert.is_some())
                .map_err(|err| RenderError::template(&spec.domain, err.to_string()))?;
        }

        let mut header = String::new();
        write_header(&mut header, &tls_domains, &stub_domains, &served)
            .map_err(|err| RenderError::template("*", err.to_string()))?;
        header.push_str(&text);

        Ok(ProxyConfigArtifact::new(header, tls_domains, stub_domains))
    }

    fn write_domain(&self, out: &mut String, spec: &DomainSpec, has_cert: bool) -> fmt::Result {
        let domain = &spec.domain;
        let upstream = upstream_name(domain);

        let address = spec.backend_address.trim();
        let address = if address.contains(':') && !address.starts_with('[') {
            format!("[{address}]")
        } else {
            address.to_owned()
        };

        writeln!(out)?;
        writeln!(out, "upstream {upstream} {{")?;
        writeln!(out, "    server {address}:{};", spec.backend_port)?;
        writeln!(out, "}}")?;

        writeln!(out)?;
        writeln!(out, "server {{")?;
        writeln!(out, "    listen 80;")?;
        writeln!(out, "    listen [::]:80;")?;
        writeln!(out, "    server_name {domain};")?;

        if let Some(challenge_upstream) = &self.options.challenge_upstream {
            writeln!(out)?;
            writeln!(out, "    location {HTTP01_PATH_PREFIX} {{")?;
            writeln!(out, "        proxy_pass http://{challenge_upstream};")?;
            writeln!(out, "        proxy_set_header Host $host;")?;
            writeln!(out, "    }}")?;
        }

        writeln!(out)?;
        writeln!(out, "    location / {{")?;
        if has_cert {
            writeln!(out, "        return 301 https://$host$request_uri;")?;
        } else {
            write_proxy(out, &upstream)?;
        }
        writeln!(out, "    }}")?;
        writeln!(out, "}}")?;

        if has_cert {
            let paths = CertPaths::new(&self.options.cert_dir, domain);

            writeln!(out)?;
            writeln!(out, "server {{")?;
            writeln!(out, "    listen 443 ssl;")?;
            writeln!(out, "    listen [::]:443 ssl;")?;
            writeln!(out, "    server_name {domain};")?;
            writeln!(out)?;
            writeln!(out, "    ssl_certificate {};", paths.fullchain.display())?;
            writeln!(out, "    ssl_certificate_key {};", paths.privkey.display())?;
            writeln!(out)?;
            writeln!(out, "    location / {{")?;
            write_proxy(out, &upstream)?;
            writeln!(out, "    }}")?;
            writeln!(out, "}}")?;
        }

        Ok(())
    }
}

/// `<domain> <expiry> sha256:<fingerprint>` of the certificate served for a domain.
///
/// Listed in the header so that a renewed certificate changes the artifact hash even though the
/// directives referencing its files stay the same.
pub(crate) fn certificate_identity(cert: &CertificateRecord) -> Result<String, RenderError> {
    let expires_at = cert
        .expires_at
        .format(&Rfc3339)
        .map_err(|err| RenderError::template(&cert.domain, err.to_string()))?;

    let fingerprint = Sha256::digest(cert.full_chain().as_bytes())
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect::<String>();

    Ok(format!("{} {expires_at} sha256:{fingerprint}", cert.domain))
}

fn write_header(
    out: &mut String,
    tls_domains: &[String],
    stub_domains: &[String],
    served: &[String],
) -> fmt::Result {
    writeln!(out, "# Generated by certsync; changes are overwritten.")?;
    writeln!(out, "# tls: {}", tls_domains.join(" "))?;
    writeln!(out, "# stub: {}", stub_domains.join(" "))?;
    for identity in served {
        writeln!(out, "# cert: {identity}")?;
    }
    writeln!(out)?;
    writeln!(out, "map $http_upgrade $certsync_connection_upgrade {{")?;
    writeln!(out, "    default upgrade;")?;
    writeln!(out, "    ''      close;")?;
    writeln!(out, "}}")
}

fn write_proxy(out: &mut String, upstream: &str) -> fmt::Result {
    writeln!(out, "        proxy_pass http://{upstream};")?;
    writeln!(out, "        proxy_http_version 1.1;")?;
    writeln!(out, "        proxy_set_header Host $host;")?;
    writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;")?;
    writeln!(out, "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;")?;
    writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;")?;
    writeln!(out, "        proxy_set_header Upgrade $http_upgrade;")?;
    writeln!(out, "        proxy_set_header Connection $certsync_connection_upgrade;")
}

/// Upstream identifier of `domain`.
///
/// Labels never contain `_`, so the mapping is injective.
fn upstream_name(domain: &str) -> String {
    format!("certsync_{}", domain.trim_end_matches('.').replace('.', "_"))
}
