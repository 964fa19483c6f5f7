//! TLS certificate provisioning.
//!
//! The server core only consumes an `Arc<rustls::ServerConfig>`. This module
//! produces one, either from PEM files on disk or from a freshly generated
//! self-signed certificate (handy for local testing, not for production).

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in '{}'", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in '{}'", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("failed to generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// A certificate chain and its private key.
pub struct Identity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Load a PEM certificate chain and PEM private key.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let mut reader = open(cert_path)?;
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| TlsError::Read {
                path: cert_path.to_path_buf(),
                source,
            })?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
        }

        let mut reader = open(key_path)?;
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|source| TlsError::Read {
                path: key_path.to_path_buf(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

        Ok(Self { certs, key })
    }

    /// Generate a self-signed certificate for the given subject names.
    pub fn generate(names: &[String]) -> Result<Self, TlsError> {
        let certified = rcgen::generate_simple_self_signed(names.to_vec())?;
        let certs = vec![certified.cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        Ok(Self { certs, key })
    }

    /// The leaf certificate.
    #[cfg(test)]
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certs[0]
    }

    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, TlsError> {
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }

    /// A client config that trusts only this identity's certificate.
    #[cfg(test)]
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>, TlsError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.certificate().clone())?;
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

/// Server config backed by a new self-signed certificate.
pub fn self_signed(names: &[String]) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    Identity::generate(names)?.server_config()
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pipecho-{}-{name}", std::process::id()))
    }

    #[test]
    fn test_generate_self_signed() {
        let identity = Identity::generate(&["localhost".to_string()]).unwrap();
        assert!(!identity.certificate().is_empty());
        assert!(identity.server_config().is_ok());
    }

    #[test]
    fn test_load_pem_files() {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = temp_path("cert.pem");
        let key_path = temp_path("key.pem");
        File::create(&cert_path)
            .unwrap()
            .write_all(certified.cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();

        let identity = Identity::from_pem_files(&cert_path, &key_path).unwrap();
        assert_eq!(identity.certificate(), certified.cert.der());
        assert!(identity.server_config().is_ok());

        // A certificate file is not a key file.
        let err = Identity::from_pem_files(&cert_path, &cert_path).err().unwrap();
        assert!(matches!(err, TlsError::NoPrivateKey(_)));

        let _ = std::fs::remove_file(cert_path);
        let _ = std::fs::remove_file(key_path);
    }

    #[test]
    fn test_missing_file() {
        let missing = temp_path("does-not-exist.pem");
        let err = Identity::from_pem_files(&missing, &missing).err().unwrap();
        assert!(matches!(err, TlsError::Read { .. }));
    }
}
