//! HTTP/1 encoder fetcher.
//!
//! One connection per download, driven by hyper's low-level client over
//! either plain TCP or a rustls stream. `https://` endpoints are always
//! served; plain `http://` and loopback hosts need developer options.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use signals_core::DevContext;
use signals_core::config::FetchConfig;
use signals_encoding::{EncoderFetcher, FetchedEncoder};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

const MAX_ENCODER_BYTES: usize = 1024 * 1024;

pub struct HttpEncoderFetcher {
    timeout: Duration,
    tls: TlsConnector,
}

impl HttpEncoderFetcher {
    /// Fetcher trusting the Mozilla root set.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Ok(Self::with_tls_config(timeout, Arc::new(config)))
    }

    pub fn with_tls_config(timeout: Duration, config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            timeout,
            tls: TlsConnector::from(config),
        }
    }

    pub fn from_config(config: &FetchConfig) -> anyhow::Result<Self> {
        Self::new(config.timeout())
    }

    async fn fetch_target(&self, target: &Target) -> anyhow::Result<FetchedEncoder> {
        let stream = TcpStream::connect(&target.address)
            .await
            .with_context(|| format!("connecting to {}", target.address))?;

        if !target.tls {
            return fetch_over(TokioIo::new(stream), target).await;
        }
        let server_name = ServerName::try_from(target.host.clone())
            .with_context(|| format!("invalid tls server name '{}'", target.host))?;
        let stream = self
            .tls
            .connect(server_name, stream)
            .await
            .with_context(|| format!("tls handshake with {}", target.address))?;
        fetch_over(TokioIo::new(stream), target).await
    }
}

#[async_trait]
impl EncoderFetcher for HttpEncoderFetcher {
    async fn fetch(&self, uri: &str, dev: DevContext) -> anyhow::Result<FetchedEncoder> {
        let target = parse_target(uri, dev)?;
        tokio::time::timeout(self.timeout, self.fetch_target(&target))
            .await
            .map_err(|_| anyhow!("encoder download from {uri} timed out after {:?}", self.timeout))?
    }
}

/// A validated download target.
#[derive(Debug)]
struct Target {
    uri: http::Uri,
    /// Host without IPv6 brackets.
    host: String,
    /// `host:port` to connect to.
    address: String,
    tls: bool,
}

fn parse_target(uri: &str, dev: DevContext) -> anyhow::Result<Target> {
    let parsed: http::Uri = uri
        .parse()
        .with_context(|| format!("invalid encoder uri '{uri}'"))?;
    let (tls, default_port) = match parsed.scheme_str() {
        Some("https") => (true, 443),
        Some("http") if dev.dev_options_enabled => (false, 80),
        Some("http") => bail!("plain-http encoder uri '{uri}' requires developer options"),
        Some(other) => bail!("unsupported encoder uri scheme '{other}'"),
        None => bail!("encoder uri '{uri}' has no scheme"),
    };
    let host = parsed
        .host()
        .ok_or_else(|| anyhow!("encoder uri '{uri}' has no host"))?;
    if is_loopback(host) && !dev.dev_options_enabled {
        bail!("loopback encoder uri '{uri}' requires developer options");
    }
    let port = parsed.port_u16().unwrap_or(default_port);
    let address = format!("{host}:{port}");
    let host = host.trim_matches(['[', ']']).to_string();
    Ok(Target {
        uri: parsed,
        host,
        address,
        tls,
    })
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .trim_matches(['[', ']'])
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

async fn fetch_over<T>(io: T, target: &Target) -> anyhow::Result<FetchedEncoder>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("http handshake failed")?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "encoder fetch connection closed");
        }
    });

    let uri = &target.uri;
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    let host = uri.authority().map_or(target.address.as_str(), |a| a.as_str());
    let request = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", host)
        .header("user-agent", "signalsd/0.1")
        .body(Empty::<Bytes>::new())?;

    let response = sender
        .send_request(request)
        .await
        .context("encoder request failed")?;
    let status = response.status();
    if !status.is_success() {
        bail!("encoder download returned {status}");
    }

    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    let body = response
        .into_body()
        .collect()
        .await
        .context("reading encoder body")?
        .to_bytes();
    if body.len() > MAX_ENCODER_BYTES {
        bail!("encoder body of {} bytes exceeds {MAX_ENCODER_BYTES}", body.len());
    }
    let body = String::from_utf8(body.to_vec()).context("encoder body is not UTF-8")?;
    debug!(%uri, bytes = body.len(), tls = target.tls, "encoder downloaded");

    Ok(FetchedEncoder { body, headers })
}
