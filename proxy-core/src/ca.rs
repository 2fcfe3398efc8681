//! Certificate Authority for MITM interception.
//!
//! Handles persistence of the root CA certificate and private key, and
//! dynamic generation of per-host leaf certificates signed by the root.
//! Leaves are cached in a bounded LRU keyed by host; concurrent mint
//! requests for the same host coalesce into a single signer invocation.

use crate::error::ProxyError;
use crate::Result;
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::{Certificate as RustlsCertificate, PrivateKey};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tracing::info;

pub const LEAF_CACHE_CAPACITY: usize = 1024;

/// A minted leaf: certificate chain (leaf first, root appended) plus the
/// private key, ready for a rustls server config.
pub struct LeafCert {
    pub chain: Vec<RustlsCertificate>,
    pub key: PrivateKey,
    pub not_after: OffsetDateTime,
}

struct LeafCache {
    entries: HashMap<String, (Arc<LeafCert>, u64)>,
    clock: u64,
    capacity: usize,
}

impl LeafCache {
    fn get(&mut self, host: &str) -> Option<Arc<LeafCert>> {
        let now = OffsetDateTime::now_utc();
        if let Some((leaf, _)) = self.entries.get(host) {
            if leaf.not_after <= now {
                self.entries.remove(host);
                return None;
            }
        }
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(host).map(|(leaf, stamp)| {
            *stamp = clock;
            leaf.clone()
        })
    }

    fn insert(&mut self, host: String, leaf: Arc<LeafCert>) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&host) {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(h, _)| h.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.clock += 1;
        self.entries.insert(host, (leaf, self.clock));
    }
}

pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_cert_pem: String,
    ca_cert_der: Vec<u8>,
    leaf_ttl: Duration,
    cache: Mutex<LeafCache>,
    /// Per-host mint gates so concurrent requests coalesce.
    minting: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CertificateAuthority {
    /// Load the CA from `ca_dir`, or generate and persist a new one.
    pub fn new(ca_dir: &Path, leaf_ttl_days: u32) -> Result<Self> {
        let ca_cert_path = ca_dir.join("ca.pem");
        let ca_key_path = ca_dir.join("ca.key");

        let ca_cert = if ca_cert_path.exists() && ca_key_path.exists() {
            info!(path = %ca_cert_path.display(), "loading existing CA");
            Self::load(&ca_cert_path, &ca_key_path)?
        } else {
            if !ca_dir.exists() {
                fs::create_dir_all(ca_dir)?;
            }
            info!(path = %ca_cert_path.display(), "generating new CA");
            Self::generate_and_save(&ca_cert_path, &ca_key_path)?
        };

        let ca_cert_pem = ca_cert
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("failed to serialize CA cert: {}", e)))?;
        let ca_cert_der = ca_cert
            .serialize_der()
            .map_err(|e| ProxyError::Certificate(format!("failed to serialize CA DER: {}", e)))?;

        Ok(Self {
            ca_cert,
            ca_cert_pem,
            ca_cert_der,
            leaf_ttl: Duration::days(i64::from(leaf_ttl_days)),
            cache: Mutex::new(LeafCache {
                entries: HashMap::new(),
                clock: 0,
                capacity: LEAF_CACHE_CAPACITY,
            }),
            minting: DashMap::new(),
        })
    }

    fn ca_params(key_pair: Option<KeyPair>) -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "webmod CA");
        dn.push(DnType::OrganizationName, "webmod");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        params.alg = &PKCS_ECDSA_P256_SHA256;
        params.key_pair = key_pair;
        params
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Certificate> {
        let key_pem = fs::read_to_string(key_path)?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| ProxyError::Certificate(format!("failed to parse CA key: {}", e)))?;

        // rcgen cannot re-load a signed certificate for signing, so the CA
        // cert is recreated from the persisted key with the fixed DN.
        let _ = cert_path;
        Certificate::from_params(Self::ca_params(Some(key_pair)))
            .map_err(|e| ProxyError::Certificate(format!("failed to recreate CA cert: {}", e)))
    }

    fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Certificate> {
        let mut params = Self::ca_params(None);
        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(365 * 10);

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("failed to generate CA cert: {}", e)))?;

        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(format!("failed to serialize CA cert: {}", e)))?;
        let key_pem = cert.serialize_private_key_pem();

        fs::write(cert_path, &cert_pem)?;
        fs::write(key_path, &key_pem)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(cert)
    }

    /// Leaf certificate for `host`, minted on first use and cached.
    /// Concurrent callers for the same host wait on one mint.
    pub async fn leaf_for_host(&self, host: &str) -> Result<Arc<LeafCert>> {
        if let Some(leaf) = self.cached(host) {
            return Ok(leaf);
        }

        let gate = self
            .minting
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // Another caller may have minted while this one waited.
        if let Some(leaf) = self.cached(host) {
            return Ok(leaf);
        }

        let leaf = Arc::new(self.mint(host)?);
        {
            let mut cache = match self.cache.lock() {
                Ok(c) => c,
                Err(poisoned) => poisoned.into_inner(),
            };
            cache.insert(host.to_string(), leaf.clone());
        }
        self.minting.remove(host);
        Ok(leaf)
    }

    fn cached(&self, host: &str) -> Option<Arc<LeafCert>> {
        let mut cache = match self.cache.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.get(host)
    }

    fn mint(&self, host: &str) -> Result<LeafCert> {
        let mut params = CertificateParams::new(vec![host.to_string()]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.use_authority_key_identifier_extension = false;
        params.alg = &PKCS_ECDSA_P256_SHA256;

        let not_before = OffsetDateTime::now_utc() - Duration::days(1);
        let not_after = not_before + self.leaf_ttl;
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(format!("failed to build leaf params: {}", e)))?;

        let cert_pem = cert
            .serialize_pem_with_signer(&self.ca_cert)
            .map_err(|e| ProxyError::Certificate(format!("failed to sign leaf cert: {}", e)))?;
        let key_pem = cert.serialize_private_key_pem();

        let mut leaf_certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .map_err(|e| ProxyError::Certificate(format!("failed to parse leaf PEM: {}", e)))?;
        let leaf_der = leaf_certs
            .drain(..)
            .next()
            .ok_or_else(|| ProxyError::Certificate("empty leaf PEM".to_string()))?;

        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes())
            .map_err(|e| ProxyError::Certificate(format!("failed to parse leaf key: {}", e)))?;
        let key_der = keys
            .drain(..)
            .next()
            .ok_or_else(|| ProxyError::Certificate("empty leaf key PEM".to_string()))?;

        Ok(LeafCert {
            chain: vec![
                RustlsCertificate(leaf_der),
                RustlsCertificate(self.ca_cert_der.clone()),
            ],
            key: PrivateKey(key_der),
            not_after,
        })
    }

    /// Root CA certificate in PEM form, for operator installation.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn cached_leaf_count(&self) -> usize {
        match self.cache.lock() {
            Ok(c) => c.entries.len(),
            Err(poisoned) => poisoned.into_inner().entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn generation_and_reload() {
        let dir = tempdir().unwrap();

        let ca = CertificateAuthority::new(dir.path(), 825).expect("generate CA");
        assert!(dir.path().join("ca.pem").exists());
        assert!(dir.path().join("ca.key").exists());
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));

        let ca2 = CertificateAuthority::new(dir.path(), 825).expect("load CA");
        let leaf = ca2.leaf_for_host("example.test").await.unwrap();
        assert_eq!(leaf.chain.len(), 2);
    }

    #[tokio::test]
    async fn leaf_minting_is_cached() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::new(dir.path(), 825).unwrap();

        let first = ca.leaf_for_host("cache.test").await.unwrap();
        let second = ca.leaf_for_host("cache.test").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ca.cached_leaf_count(), 1);
    }

    #[tokio::test]
    async fn distinct_hosts_get_distinct_leaves() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::new(dir.path(), 825).unwrap();

        let a = ca.leaf_for_host("a.test").await.unwrap();
        let b = ca.leaf_for_host("b.test").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(ca.cached_leaf_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_mints_coalesce() {
        let dir = tempdir().unwrap();
        let ca = Arc::new(CertificateAuthority::new(dir.path(), 825).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ca = ca.clone();
            handles.push(tokio::spawn(
                async move { ca.leaf_for_host("race.test").await },
            ));
        }
        let leaves: Vec<Arc<LeafCert>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        for leaf in &leaves[1..] {
            assert!(Arc::ptr_eq(&leaves[0], leaf));
        }
    }

    #[test]
    fn lru_evicts_oldest() {
        let mut cache = LeafCache {
            entries: HashMap::new(),
            clock: 0,
            capacity: 2,
        };
        let mk = || {
            Arc::new(LeafCert {
                chain: Vec::new(),
                key: PrivateKey(Vec::new()),
                not_after: OffsetDateTime::now_utc() + Duration::days(1),
            })
        };
        cache.insert("a".to_string(), mk());
        cache.insert("b".to_string(), mk());
        assert!(cache.get("a").is_some()); // refresh "a"
        cache.insert("c".to_string(), mk());
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn expired_leaves_are_evicted_on_get() {
        let mut cache = LeafCache {
            entries: HashMap::new(),
            clock: 0,
            capacity: 4,
        };
        cache.insert(
            "old.test".to_string(),
            Arc::new(LeafCert {
                chain: Vec::new(),
                key: PrivateKey(Vec::new()),
                not_after: OffsetDateTime::now_utc() - Duration::days(1),
            }),
        );
        assert!(cache.get("old.test").is_none());
    }
}
