//! Certificate material and account keys persisted on disk.
//!
//! Layout under the storage root:
//!
//! ```text
//! accounts/<contact>.pem
//! domains/<domain>/cert.pem
//! domains/<domain>/chain.pem
//! domains/<domain>/fullchain.pem
//! domains/<domain>/privkey.pem
//! domains/<domain>/meta.json
//! status.json
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place. `meta.json` is written
//! last, so a domain directory without it holds no usable certificate. `status.json` holds the
//! reconciler's latest [`StatusSnapshot`].

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

use eyre::{eyre, WrapErr as _};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt as _};
use zeroize::Zeroizing;

use crate::domain::{is_valid_domain, CertificateRecord, StatusSnapshot};

const CERT_FILE: &str = "cert.pem";
const CHAIN_FILE: &str = "chain.pem";
const FULLCHAIN_FILE: &str = "fullchain.pem";
const PRIVKEY_FILE: &str = "privkey.pem";
const META_FILE: &str = "meta.json";
const STATUS_FILE: &str = "status.json";

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    domain: String,
    #[serde(with = "time::serde::rfc3339")]
    issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
    issuer: String,
}

/// Paths of the files a proxy reads for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub fullchain: PathBuf,
    pub privkey: PathBuf,
}

impl CertPaths {
    /// Paths for `domain` below the storage `root`.
    pub fn new(root: &Path, domain: &str) -> Self {
        let dir = root.join("domains").join(domain);

        Self {
            fullchain: dir.join(FULLCHAIN_FILE),
            privkey: dir.join(PRIVKEY_FILE),
        }
    }
}

/// File system store of [`CertificateRecord`]s and ACME account keys.
#[derive(Debug, Clone)]
pub struct CertStore {
    root: PathBuf,
}

impl CertStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn domain_dir(&self, domain: &str) -> eyre::Result<PathBuf> {
        // the name becomes a path component
        if !is_valid_domain(domain) {
            return Err(eyre!("refusing to store material for invalid domain {domain:?}"));
        }

        Ok(self.root.join("domains").join(domain))
    }

    fn account_key_path(&self, contact_email: &str) -> PathBuf {
        let name = contact_email
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '@' | '.' | '_' | '+' | '-' => c,
                _ => '_',
            })
            .collect::<String>();

        let name = name.trim_start_matches('.');

        self.root.join("accounts").join(format!("{name}.pem"))
    }

    /// Loads the record of `domain`, if one has been saved.
    pub async fn load(&self, domain: &str) -> eyre::Result<Option<CertificateRecord>> {
        let dir = self.domain_dir(domain)?;

        let Some(meta) = read_optional(&dir.join(META_FILE)).await? else {
            return Ok(None);
        };

        let meta: Meta = serde_json::from_str(&meta)
            .wrap_err_with(|| format!("parsing {}", dir.join(META_FILE).display()))?;

        let cert_pem = read(&dir.join(CERT_FILE)).await?;
        let chain_pem = read(&dir.join(CHAIN_FILE)).await?;
        let key_pem = Zeroizing::new(read(&dir.join(PRIVKEY_FILE)).await?);

        let record = CertificateRecord::new(
            meta.domain,
            cert_pem,
            key_pem,
            chain_pem,
            meta.issued_at,
            meta.expires_at,
            meta.issuer,
        )?;

        Ok(Some(record))
    }

    /// Loads the records of every stored domain.
    ///
    /// Domains with unreadable material are logged and skipped.
    pub async fn load_all(&self) -> eyre::Result<HashMap<String, CertificateRecord>> {
        let mut records = HashMap::new();

        let mut entries = match fs::read_dir(self.root.join("domains")).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(err) => return Err(err).wrap_err("listing stored domains"),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(domain) = entry.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };

            match self.load(&domain).await {
                Ok(Some(record)) => {
                    records.insert(domain, record);
                }
                Ok(None) => {}
                Err(err) => log::warn!("Skipping stored material of {domain}: {err:#}"),
            }
        }

        Ok(records)
    }

    /// Saves `record`, replacing any previous material of its domain.
    pub async fn save(&self, record: &CertificateRecord) -> eyre::Result<()> {
        let dir = self.domain_dir(&record.domain)?;
        fs::create_dir_all(&dir)
            .await
            .wrap_err_with(|| format!("creating {}", dir.display()))?;

        let meta = Meta {
            domain: record.domain.clone(),
            issued_at: record.issued_at,
            expires_at: record.expires_at,
            issuer: record.issuer.clone(),
        };

        write_atomic(&dir.join(PRIVKEY_FILE), record.key_pem.as_bytes(), true).await?;
        write_atomic(&dir.join(CERT_FILE), record.cert_pem.as_bytes(), false).await?;
        write_atomic(&dir.join(CHAIN_FILE), record.chain_pem.as_bytes(), false).await?;
        write_atomic(&dir.join(FULLCHAIN_FILE), record.full_chain().as_bytes(), false).await?;
        write_atomic(
            &dir.join(META_FILE),
            serde_json::to_string_pretty(&meta)?.as_bytes(),
            false,
        )
        .await?;

        log::debug!("Saved certificate of {} to {}", record.domain, dir.display());

        Ok(())
    }

    /// Deletes all material of `domain`. Missing material is not an error.
    pub async fn remove(&self, domain: &str) -> eyre::Result<()> {
        let dir = self.domain_dir(domain)?;

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                log::info!("Deleted stored material of {domain}");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).wrap_err_with(|| format!("deleting {}", dir.display())),
        }
    }

    /// Loads the ACME account key (PKCS#8 PEM) of `contact_email`, if one has been saved.
    pub async fn load_account_key(
        &self,
        contact_email: &str,
    ) -> eyre::Result<Option<Zeroizing<String>>> {
        let pem = read_optional(&self.account_key_path(contact_email)).await?;
        Ok(pem.map(Zeroizing::new))
    }

    pub async fn save_account_key(&self, contact_email: &str, pem: &str) -> eyre::Result<()> {
        let path = self.account_key_path(contact_email);

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .wrap_err_with(|| format!("creating {}", dir.display()))?;
        }

        write_atomic(&path, pem.as_bytes(), true).await
    }

    /// Loads the last saved status snapshot.
    pub async fn load_status(&self) -> eyre::Result<Option<StatusSnapshot>> {
        let path = self.root.join(STATUS_FILE);

        let Some(json) = read_optional(&path).await? else {
            return Ok(None);
        };

        let snapshot = serde_json::from_str(&json)
            .wrap_err_with(|| format!("parsing {}", path.display()))?;

        Ok(Some(snapshot))
    }

    pub async fn save_status(&self, snapshot: &StatusSnapshot) -> eyre::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .wrap_err_with(|| format!("creating {}", self.root.display()))?;

        write_atomic(
            &self.root.join(STATUS_FILE),
            serde_json::to_string_pretty(snapshot)?.as_bytes(),
            false,
        )
        .await
    }
}

async fn read(path: &Path) -> eyre::Result<String> {
    fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading {}", path.display()))
}

async fn read_optional(path: &Path) -> eyre::Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).wrap_err_with(|| format!("reading {}", path.display())),
    }
}

/// Writes `contents` to a temporary sibling of `path` and renames it into place.
///
/// Private files are created with mode 0600.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8], private: bool) -> eyre::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| eyre!("not a file path: {}", path.display()))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    // a stale temp file would keep its old mode
    match fs::remove_file(&tmp).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).wrap_err_with(|| format!("removing {}", tmp.display())),
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);

    #[cfg(unix)]
    if private {
        opts.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    let mut file = opts
        .open(&tmp)
        .await
        .wrap_err_with(|| format!("creating {}", tmp.display()))?;

    file.write_all(contents)
        .await
        .wrap_err_with(|| format!("writing {}", tmp.display()))?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp, path)
        .await
        .wrap_err_with(|| format!("renaming {} to {}", tmp.display(), path.display()))
}
