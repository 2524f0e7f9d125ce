//! Reloadable TLS credentials for RPC listeners.
//!
//! Certificate material can be rotated without restarting the listener: a
//! rebuild loads the PEM files again and atomically swaps the acceptor used
//! for new connections. Existing connections keep their session. A rebuild
//! failure notifies the registered observer and keeps the previous
//! credentials in place; it is logged, never fatal.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::TlsSettings;
use crate::error::{NodeError, NodeResult};
use crate::metrics;

/// Callback invoked after every credential reload attempt with the set of
/// reloaded identity names and the error, if the reload failed.
pub type ReloadObserver = Arc<dyn Fn(&[String], Option<&NodeError>) + Send + Sync>;

/// The default observer: logs the reload outcome for a listener.
pub fn log_reload_event(listener: &'static str) -> ReloadObserver {
    Arc::new(move |names: &[String], error: Option<&NodeError>| match error {
        None => info!(listener, identities = ?names, "TLS credentials reloaded"),
        Some(e) => warn!(
            listener,
            identities = ?names,
            error = %e,
            "TLS credential reload failed; keeping previous credentials"
        ),
    })
}

/// A server credential set that can be rebuilt in place.
pub struct ReloadableTls {
    name: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    acceptor: RwLock<TlsAcceptor>,
    observer: ReloadObserver,
}

impl ReloadableTls {
    /// Build the initial credential set. Failure here is a start-up error.
    pub fn build(settings: &TlsSettings, observer: ReloadObserver) -> NodeResult<Self> {
        let acceptor = load_acceptor(&settings.cert_path, &settings.key_path)?;
        Ok(Self {
            name: settings.name.clone(),
            cert_path: settings.cert_path.clone(),
            key_path: settings.key_path.clone(),
            acceptor: RwLock::new(acceptor),
            observer,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The acceptor to use for the next connection.
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.read().unwrap().clone()
    }

    /// Reload certificate material from disk.
    ///
    /// On success the new credentials are swapped in for new connections and
    /// the observer is notified with the reloaded identity names. On failure
    /// the previous credentials stay live and the observer receives the
    /// error.
    pub fn rebuild(&self) {
        let names = vec![self.name.clone()];
        match load_acceptor(&self.cert_path, &self.key_path) {
            Ok(acceptor) => {
                *self.acceptor.write().unwrap() = acceptor;
                metrics::record_credential_reload(true);
                (self.observer)(&names, None);
            }
            Err(e) => {
                metrics::record_credential_reload(false);
                (self.observer)(&names, Some(&e));
            }
        }
    }
}

fn load_acceptor(cert_path: &Path, key_path: &Path) -> NodeResult<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NodeError::Tls(format!("TLS configuration error: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load certificates from a PEM file.
fn load_certs(path: &Path) -> NodeResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| NodeError::Tls(format!("Failed to open certificate file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NodeError::Tls(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(NodeError::Tls(format!(
            "No certificates found in {:?}",
            path
        )));
    }

    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &Path) -> NodeResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| NodeError::Tls(format!("Failed to open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| NodeError::Tls(format!("Failed to parse key file: {}", e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Some(rustls_pemfile::Item::Sec1Key(key)) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            None => break,
            _ => continue,
        }
    }

    Err(NodeError::Tls(format!("No private key found in {:?}", path)))
}
