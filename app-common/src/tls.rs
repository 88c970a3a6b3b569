//! Option groups for securing DICOM connections with TLS.
//!
//! These build `rustls` configurations from PEM files given
//! on the command line;
//! the network crates only perform the TLS wrap
//! and stay agnostic of where the material comes from.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

#[derive(Snafu, Debug)]
pub enum TlsError {
    #[snafu(display("PEM parse error in {}", path.display()))]
    PemParse {
        source: rustls::pki_types::pem::Error,
        path: PathBuf,
    },

    #[snafu(display("Invalid TLS configuration"))]
    Rustls { source: rustls::Error },

    #[snafu(display("Could not load system root certificates"))]
    SystemRoots { source: std::io::Error },

    /// Missing private key
    MissingKey,

    /// Missing certificate
    MissingCertificate,
}

/// TLS options of a connecting tool (an SCU).
#[derive(Args, Debug)]
pub struct TlsConnectorOptions {
    /// secure the connection with TLS
    #[arg(long = "tls", default_value = "false")]
    pub enabled: bool,

    /// path to additional CA certificates in PEM format
    /// to trust beyond the system roots
    #[arg(long, value_name = "ca.pem")]
    pub add_certs: Vec<PathBuf>,

    /// path to the client certificate in PEM format
    /// (enables client authentication)
    #[arg(long, value_name = "cert.pem", requires = "key")]
    pub cert: Option<PathBuf>,

    /// path to the client private key in PEM format
    #[arg(long, value_name = "key.pem", requires = "cert")]
    pub key: Option<PathBuf>,
}

impl TlsConnectorOptions {
    /// Build the client configuration from these options.
    pub fn build(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        for path in &self.add_certs {
            let cert = CertificateDer::from_pem_file(path).context(PemParseSnafu { path: path.clone() })?;
            roots.add(cert).context(RustlsSnafu)?;
        }
        debug!("{} trusted root certificate(s)", roots.len());

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match (&self.cert, &self.key) {
            (Some(cert_path), Some(key_path)) => {
                let certs: Vec<_> = CertificateDer::pem_file_iter(cert_path)
                    .context(PemParseSnafu { path: cert_path.clone() })?
                    .collect::<Result<_, _>>()
                    .context(PemParseSnafu { path: cert_path.clone() })?;
                let key = PrivateKeyDer::from_pem_file(key_path)
                    .context(PemParseSnafu { path: key_path.clone() })?;
                builder
                    .with_client_auth_cert(certs, key)
                    .context(RustlsSnafu)?
            }
            _ => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

/// TLS options of a listening tool (an SCP).
#[derive(Args, Debug)]
pub struct TlsAcceptorOptions {
    /// secure accepted connections with TLS
    #[arg(long = "tls", default_value = "false")]
    pub enabled: bool,

    /// path to the server certificate (chain) in PEM format
    #[arg(long, value_name = "cert.pem")]
    pub cert: Option<PathBuf>,

    /// path to the server private key in PEM format
    #[arg(long, value_name = "key.pem")]
    pub key: Option<PathBuf>,
}

impl TlsAcceptorOptions {
    /// Build the server configuration from these options.
    pub fn build(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let cert_path = self.cert.as_ref().context(MissingCertificateSnafu)?;
        let key_path = self.key.as_ref().context(MissingKeySnafu)?;

        let certs: Vec<_> = CertificateDer::pem_file_iter(cert_path)
            .context(PemParseSnafu { path: cert_path.clone() })?
            .collect::<Result<_, _>>()
            .context(PemParseSnafu { path: cert_path.clone() })?;
        let key =
            PrivateKeyDer::from_pem_file(key_path).context(PemParseSnafu { path: key_path.clone() })?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context(RustlsSnafu)?;
        Ok(Arc::new(config))
    }
}
