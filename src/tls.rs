use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio_rustls::TlsAcceptor;

/// Builds the server TLS context from a PEM certificate chain and a PKCS#8
/// private key
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("Failed to open certificate: {:?}", cert_path))?;
    let cert_chain: Vec<Certificate> = certs(&mut BufReader::new(cert_file))
        .map_err(|_| anyhow::anyhow!("Failed to parse certificate: {:?}", cert_path))?
        .into_iter()
        .map(Certificate)
        .collect();
    if cert_chain.is_empty() {
        return Err(anyhow::anyhow!("No certificate found in {:?}", cert_path));
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("Failed to open private key: {:?}", key_path))?;
    let mut keys = pkcs8_private_keys(&mut BufReader::new(key_file))
        .map_err(|_| anyhow::anyhow!("Failed to parse private key: {:?}", key_path))?;
    if keys.is_empty() {
        return Err(anyhow::anyhow!("No private key found in {:?}", key_path));
    }
    let private_key = PrivateKey(keys.remove(0));

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow::anyhow!("Failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
