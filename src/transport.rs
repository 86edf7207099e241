// src/transport.rs

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{split, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::{client::TlsStream, TlsConnector};

/// A TLS session to a single mirror host. Reconnection is not this module's
/// responsibility — see `source::run_supervisor`.
pub struct Transport {
    stream: TlsStream<TcpStream>,
}

pub type TransportRead = ReadHalf<TlsStream<TcpStream>>;
pub type TransportWrite = WriteHalf<TlsStream<TcpStream>>;

impl Transport {
    /// Splits the session into independent read/write halves so the
    /// protocol state machine can drive both concurrently.
    pub fn split(self) -> (TransportRead, TransportWrite) {
        split(self.stream)
    }
}

fn tls_connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Opens a TLS connection to `{host}:{port}` with SNI set to `host`.
/// Certificate validation against the system trust store is mandatory.
pub async fn connect(host: &str, port: u16) -> Result<Transport> {
    let addr = format!("{host}:{port}");
    let tcp = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;

    let connector = tls_connector();
    let server_name = ServerName::try_from(host)
        .map_err(|_| anyhow::anyhow!("invalid DNS name for SNI: {host}"))?;

    let stream = connector
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {host}"))?;

    Ok(Transport { stream })
}
