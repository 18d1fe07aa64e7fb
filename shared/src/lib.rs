#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod tls;
pub mod uri;

use p12_keystore::{KeyStore, KeyStoreEntry};
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::error::Error;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::{fs, io};
use time::{Duration, OffsetDateTime};
use tracing::{debug, trace};

const CA_VALIDITY_DAYS: i64 = 365 * 10;
const P12_PASSWORD: &str = "wsgiprox";

/// Options for opening (or creating) the on-disk certificate authority.
#[derive(Debug, Clone)]
pub struct CaOptions {
    /// Directory holding the CA bundle and minted leaves. `None` means
    /// `~/.wsgiprox`.
    pub root_dir: Option<PathBuf>,
    /// Filename of the CA bundle (private key + certificate PEM) within
    /// `root_dir`.
    pub ca_file: String,
    /// Common name used when a fresh root has to be generated.
    pub ca_name: String,
    /// Sub-directory of `root_dir` holding per-host minted leaves.
    pub certs_dir: String,
}

impl Default for CaOptions {
    fn default() -> Self {
        CaOptions {
            root_dir: None,
            ca_file: "wsgiprox-ca.pem".to_string(),
            ca_name: "wsgiprox https proxy CA".to_string(),
            certs_dir: "certs".to_string(),
        }
    }
}

/// Process-wide certificate factory: a root CA plus a cache of per-host
/// leaf certificates minted on demand.
///
/// Cloning is cheap; all clones share the same root material and leaf
/// cache. Leaf generation is safe for concurrent callers.
#[derive(Debug, Clone)]
pub struct CertAuthority {
    inner: Arc<CaInner>,
}

#[derive(Debug)]
struct CaInner {
    issuer: Issuer<'static, KeyPair>,
    ca_name: String,
    ca_der: Vec<u8>,
    ca_pem: String,
    certs_dir: PathBuf,
    leaf_cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

#[derive(Debug)]
pub enum CaError {
    Io(std::io::Error),
    RcGen(rcgen::Error),
    KeyStore(p12_keystore::error::Error),
    RustLS(rustls::Error),
    RustLSPem(rustls::pki_types::pem::Error),
    KeyParse,
    NoCryptoProvider,
}

impl Error for CaError {}

impl std::fmt::Display for CaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for CaError {
    fn from(value: std::io::Error) -> Self {
        CaError::Io(value)
    }
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        CaError::RcGen(value)
    }
}

impl From<p12_keystore::error::Error> for CaError {
    fn from(value: p12_keystore::error::Error) -> Self {
        CaError::KeyStore(value)
    }
}

impl From<rustls::Error> for CaError {
    fn from(value: rustls::Error) -> Self {
        CaError::RustLS(value)
    }
}

impl From<rustls::pki_types::pem::Error> for CaError {
    fn from(value: rustls::pki_types::pem::Error) -> Self {
        CaError::RustLSPem(value)
    }
}

struct CaFiles {
    bundle_path: PathBuf,
    cert_path: PathBuf,
}

impl CaFiles {
    fn new(root: &Path, ca_file: &str) -> Self {
        let bundle_path = root.join(ca_file);
        let stem = ca_file.trim_end_matches(".pem");
        let cert_path = root.join(format!("{stem}-cert.pem"));
        CaFiles {
            bundle_path,
            cert_path,
        }
    }
}

/// Make sure a process-default rustls provider exists before any
/// `CertifiedKey` is assembled. An application that already installed one
/// keeps it; losing an install race is equivalent.
fn ensure_crypto_provider() {
    if CryptoProvider::get_default().is_none() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

impl CertAuthority {
    /// Open the CA at the configured location, generating a fresh root (and
    /// writing it to disk) on first use.
    pub fn open(opts: CaOptions) -> Result<Self, CaError> {
        ensure_crypto_provider();

        let root_dir = match &opts.root_dir {
            Some(p) => p.clone(),
            None => match dirs::home_dir() {
                Some(p) => p.join(".wsgiprox"),
                None => return Err(CaError::Io(io::Error::other("missing home dir"))),
            },
        };
        fs::create_dir_all(&root_dir)?;

        let certs_dir = root_dir.join(&opts.certs_dir);
        fs::create_dir_all(&certs_dir)?;

        let ca_files = CaFiles::new(&root_dir, &opts.ca_file);

        let (issuer, ca_pem, ca_der) =
            if ca_files.bundle_path.exists() && ca_files.cert_path.exists() {
                trace!("CA root already exists at {}", root_dir.display());
                let bundle = fs::read_to_string(&ca_files.bundle_path)?;
                let key_pair = KeyPair::from_pem(&bundle)?;

                let ca_pem = fs::read_to_string(&ca_files.cert_path)?;
                let issuer = Issuer::from_ca_cert_pem(&ca_pem, key_pair)?;
                let ca_der = CertificateDer::from_pem_file(&ca_files.cert_path)?;

                (issuer, ca_pem, ca_der.to_vec())
            } else {
                generate_root(&ca_files, &opts.ca_name)?
            };

        Ok(CertAuthority {
            inner: Arc::new(CaInner {
                issuer,
                ca_name: opts.ca_name,
                ca_der,
                ca_pem,
                certs_dir,
                leaf_cache: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The root certificate, PEM encoded (certificate only, no key).
    pub fn root_pem(&self) -> &[u8] {
        self.inner.ca_pem.as_bytes()
    }

    /// The root certificate, DER encoded.
    pub fn root_der(&self) -> &[u8] {
        &self.inner.ca_der
    }

    /// The root certificate exported as a PKCS#12 keystore (certificate
    /// entry only).
    pub fn root_pkcs12(&self) -> Result<Vec<u8>, CaError> {
        let mut key_store = KeyStore::new();
        let certificate = p12_keystore::Certificate::from_der(&self.inner.ca_der)?;
        key_store.add_entry(&self.inner.ca_name, KeyStoreEntry::Certificate(certificate));

        let writer = key_store.writer(P12_PASSWORD);
        Ok(writer.write()?)
    }

    /// A rustls `CertifiedKey` for serving `host`, minted on first use and
    /// cached thereafter (in memory and as a PEM bundle under the leaf
    /// directory). With `wildcard` set, one leaf per parent domain covers
    /// every sibling host.
    pub fn certified_key_for(
        &self,
        host: &str,
        wildcard: bool,
    ) -> Result<Arc<CertifiedKey>, CaError> {
        let names = leaf_names(host, wildcard);

        let mut cache = self.lock_cache();
        if let Some(hit) = cache.get(&names.cache_key) {
            return Ok(hit.clone());
        }

        let leaf_path = self
            .inner
            .certs_dir
            .join(format!("{}.pem", names.cache_key));
        let key = if leaf_path.exists() {
            trace!("loading cached leaf for {host} from {}", leaf_path.display());
            let bundle = fs::read_to_string(&leaf_path)?;
            let key_pair = KeyPair::from_pem(&bundle)?;
            let cert_der = CertificateDer::from_pem_file(&leaf_path)?;
            certified_key(cert_der, &key_pair)?
        } else {
            debug!("minting leaf certificate for {host} ({})", names.cache_key);
            let (leaf, key_pair) = self.mint(&names)?;

            let bundle = format!(
                "{}\n{}",
                key_pair.serialize_pem().trim_end(),
                leaf.pem().trim_end()
            );
            fs::write(&leaf_path, bundle)?;

            certified_key(leaf.der().clone(), &key_pair)?
        };

        let key = Arc::new(key);
        cache.insert(names.cache_key, key.clone());
        Ok(key)
    }

    fn mint(&self, names: &LeafNames) -> Result<(Certificate, KeyPair), rcgen::Error> {
        let mut params = CertificateParams::new(names.sans.clone())?;

        params.distinguished_name.push(DnType::CommonName, &names.cn);
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let key_pair = KeyPair::generate()?;
        let leaf = params.signed_by(&key_pair, &self.inner.issuer)?;

        Ok((leaf, key_pair))
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, Arc<CertifiedKey>>> {
        match self.inner.leaf_cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn certified_key(
    cert_der: CertificateDer<'static>,
    key_pair: &KeyPair,
) -> Result<CertifiedKey, CaError> {
    let pk_der =
        PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|_| CaError::KeyParse)?;
    let provider = CryptoProvider::get_default().ok_or(CaError::NoCryptoProvider)?;
    Ok(CertifiedKey::from_der(
        vec![cert_der],
        pk_der,
        provider.deref(),
    )?)
}

/// Naming for a minted leaf: the cache key, the certificate CN and the
/// subject alternative names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNames {
    pub cache_key: String,
    pub cn: String,
    pub sans: Vec<String>,
}

/// With `wildcard`, `a.example.com` collapses onto its parent domain so a
/// single `*.example.com` leaf covers every sibling. IP addresses and
/// single-label hosts always get an exact leaf.
pub fn leaf_names(host: &str, wildcard: bool) -> LeafNames {
    let is_ip = host.parse::<std::net::IpAddr>().is_ok();
    let labels: Vec<&str> = host.split('.').collect();

    if wildcard && !is_ip && labels.len() >= 2 {
        let base = if labels.len() > 2 {
            labels[1..].join(".")
        } else {
            host.to_string()
        };
        LeafNames {
            cache_key: base.clone(),
            cn: base.clone(),
            sans: vec![format!("*.{base}"), base],
        }
    } else {
        LeafNames {
            cache_key: host.to_string(),
            cn: host.to_string(),
            sans: vec![host.to_string()],
        }
    }
}

fn generate_root(
    ca_files: &CaFiles,
    ca_name: &str,
) -> Result<(Issuer<'static, KeyPair>, String, Vec<u8>), CaError> {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    ca_params.distinguished_name = DistinguishedName::new();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, ca_name);
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, ca_name);

    ca_params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.key_usages.push(KeyUsagePurpose::CrlSign);

    ca_params.not_before = OffsetDateTime::now_utc();
    ca_params.not_after =
        OffsetDateTime::now_utc().saturating_add(Duration::days(CA_VALIDITY_DAYS));

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
    let ca_cert = ca_params.self_signed(&key_pair)?;

    let cert_pem = ca_cert.pem();
    let key_pem = key_pair.serialize_pem();

    let bundle = format!("{}\n{}", key_pem.trim_end(), cert_pem.trim_end());
    fs::write(&ca_files.bundle_path, bundle)?;
    fs::write(&ca_files.cert_path, &cert_pem)?;

    debug!("generated CA root:");
    debug!("  bundle {}", ca_files.bundle_path.display());
    debug!("  cert   {}", ca_files.cert_path.display());
    debug!("import the cert PEM into the client trust store to intercept TLS");

    let ca_der = ca_cert.der().to_vec();
    let issuer = Issuer::new(ca_params, key_pair);
    Ok((issuer, cert_pem, ca_der))
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp_ca() -> (tempfile::TempDir, CertAuthority) {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertAuthority::open(CaOptions {
            root_dir: Some(dir.path().to_path_buf()),
            ..CaOptions::default()
        })
        .unwrap();
        (dir, ca)
    }

    #[test]
    fn wildcard_names_collapse_onto_parent_domain() {
        let names = leaf_names("a.example.com", true);
        assert_eq!(names.cache_key, "example.com");
        assert_eq!(names.cn, "example.com");
        assert_eq!(names.sans, vec!["*.example.com", "example.com"]);
    }

    #[test]
    fn bare_domain_wildcard_covers_itself() {
        let names = leaf_names("example.com", true);
        assert_eq!(names.cache_key, "example.com");
        assert_eq!(names.sans, vec!["*.example.com", "example.com"]);
    }

    #[test]
    fn ips_and_single_labels_mint_exact() {
        let names = leaf_names("127.0.0.1", true);
        assert_eq!(names.sans, vec!["127.0.0.1"]);

        let names = leaf_names("wsgiprox", true);
        assert_eq!(names.cache_key, "wsgiprox");
        assert_eq!(names.sans, vec!["wsgiprox"]);
    }

    #[test]
    fn exact_mode_never_wildcards() {
        let names = leaf_names("a.example.com", false);
        assert_eq!(names.cache_key, "a.example.com");
        assert_eq!(names.sans, vec!["a.example.com"]);
    }

    #[test]
    fn root_is_reloaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CaOptions {
            root_dir: Some(dir.path().to_path_buf()),
            ..CaOptions::default()
        };
        let first = CertAuthority::open(opts.clone()).unwrap();
        let second = CertAuthority::open(opts).unwrap();
        assert_eq!(first.root_der(), second.root_der());
    }

    #[test]
    fn leaves_are_cached_per_parent_domain() {
        let (_dir, ca) = open_temp_ca();
        let a = ca.certified_key_for("a.example.com", true).unwrap();
        let b = ca.certified_key_for("b.example.com", true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let exact = ca.certified_key_for("a.example.com", false).unwrap();
        assert!(!Arc::ptr_eq(&a, &exact));
    }

    #[test]
    fn pkcs12_export_is_nonempty() {
        let (_dir, ca) = open_temp_ca();
        let p12 = ca.root_pkcs12().unwrap();
        assert!(!p12.is_empty());
    }
}
