//! TLS for peer streams: a client connector trusting a configured root, a server
//! acceptor from a PEM certificate chain and key.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{DropError, Result};

fn tls_err(e: rustls::Error) -> DropError {
    DropError::Tls(e.to_string())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(DropError::fs(path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(DropError::fs(path))?;
    if certs.is_empty() {
        return Err(DropError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(DropError::fs(path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(DropError::fs(path))?
        .ok_or_else(|| DropError::Tls(format!("no private key in {}", path.display())))
}

/// Connector that only trusts certificates issued by `root_ca`.
pub fn client_connector(root_ca: &Path) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(root_ca)? {
        roots.add(cert).map_err(tls_err)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_key(key)?)
        .map_err(tls_err)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Server name a dialer verifies: the peer's advertised droplet.
pub fn server_name(droplet: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(droplet.to_string())
        .map_err(|e| DropError::Tls(format!("invalid server name {droplet:?}: {e}")))
}
