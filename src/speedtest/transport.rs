//! HTTP transport seam and the timing data one probe exchange yields.

use super::error::TransportError;
use crate::settings::Settings;
use async_trait::async_trait;
use futures::StreamExt;
use rand::{RngCore, SeedableRng};
use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Discounted from TTFB when the server does not report its own processing time.
pub const ESTIMATED_SERVER_TIME_MS: f64 = 10.0;

const SERVER_TIMING: &str = "server-timing";

/// Status, headers of interest and timings of one HTTP exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub server_timing: Option<String>,
    /// Request start to response headers.
    pub ttfb: Duration,
    /// Response headers to end of body.
    pub payload: Duration,
    pub bytes_transferred: u64,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn ttfb_ms(&self) -> f64 {
        self.ttfb.as_secs_f64() * 1000.0
    }

    pub fn payload_ms(&self) -> f64 {
        self.payload.as_secs_f64() * 1000.0
    }

    pub fn server_time_ms(&self) -> f64 {
        parse_server_timing(self.server_timing.as_deref()).unwrap_or(ESTIMATED_SERVER_TIME_MS)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(self.retry_after.as_deref())
    }
}

/// Extracts `dur=<number>` from a Server-Timing header.
pub fn parse_server_timing(header: Option<&str>) -> Option<f64> {
    static DUR: OnceLock<Regex> = OnceLock::new();
    let re = DUR.get_or_init(|| Regex::new(r"dur=([0-9.]+)").expect("valid server-timing regex"));
    let caps = re.captures(header?)?;
    caps[1].parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Longest `Retry-After` honored; larger values are clamped to it.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Retry-After in delta-seconds; HTTP-date values are ignored.
pub fn parse_retry_after(header: Option<&str>) -> Option<Duration> {
    let secs: f64 = header?.trim().parse().ok()?;
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    let delay = Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_AFTER);
    Some(delay.min(MAX_RETRY_AFTER))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub colo: String,
    #[serde(default)]
    pub org: String,
}

impl ClientInfo {
    pub fn summary(&self) -> String {
        [self.ip.as_str(), self.org.as_str(), self.country.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The only way the engine touches the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Zero-byte GET used for round-trip timing.
    async fn latency(&self) -> Result<ProbeResponse, TransportError>;

    async fn download(&self, bytes: u64) -> Result<ProbeResponse, TransportError>;

    async fn upload(&self, bytes: u64) -> Result<ProbeResponse, TransportError>;

    async fn client_info(&self) -> Result<ClientInfo, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn latency(&self) -> Result<ProbeResponse, TransportError> {
        (**self).latency().await
    }

    async fn download(&self, bytes: u64) -> Result<ProbeResponse, TransportError> {
        (**self).download(bytes).await
    }

    async fn upload(&self, bytes: u64) -> Result<ProbeResponse, TransportError> {
        (**self).upload(bytes).await
    }

    async fn client_info(&self) -> Result<ClientInfo, TransportError> {
        (**self).client_info().await
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    password: Option<String>,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self, TransportError> {
        let client = Self::client_builder(settings).build()?;
        Ok(Self::with_client(client, settings))
    }

    /// Client configured with the run's timeouts.
    pub fn client_builder(settings: &Settings) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
    }

    pub fn with_client(client: reqwest::Client, settings: &Settings) -> Self {
        Self {
            client,
            base_url: settings.base_url.trim().trim_end_matches('/').to_string(),
            password: settings.password.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path));
        match &self.password {
            // Workers only check the password.
            Some(password) => builder.basic_auth("", Some(password)),
            None => builder,
        }
    }

    async fn fetch_down(&self, bytes: u64) -> Result<ProbeResponse, TransportError> {
        let start = Instant::now();
        let response = self
            .request(Method::GET, &format!("__down?bytes={}", bytes))
            .send()
            .await?;
        let headers_received = Instant::now();

        let status = response.status().as_u16();
        let (retry_after, server_timing) = timing_headers(response.headers());

        let mut stream = response.bytes_stream();
        let mut transferred: u64 = 0;
        while let Some(chunk) = stream.next().await {
            transferred += chunk?.len() as u64;
        }

        Ok(ProbeResponse {
            status,
            retry_after,
            server_timing,
            ttfb: headers_received.duration_since(start),
            payload: headers_received.elapsed(),
            bytes_transferred: transferred,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn latency(&self) -> Result<ProbeResponse, TransportError> {
        self.fetch_down(0).await
    }

    async fn download(&self, bytes: u64) -> Result<ProbeResponse, TransportError> {
        self.fetch_down(bytes).await
    }

    async fn upload(&self, bytes: u64) -> Result<ProbeResponse, TransportError> {
        let body = random_payload(bytes as usize);

        let start = Instant::now();
        let response = self.request(Method::POST, "__up").body(body).send().await?;
        let headers_received = Instant::now();

        let status = response.status().as_u16();
        let (retry_after, server_timing) = timing_headers(response.headers());
        response.bytes().await?;

        Ok(ProbeResponse {
            status,
            retry_after,
            server_timing,
            ttfb: headers_received.duration_since(start),
            payload: headers_received.elapsed(),
            bytes_transferred: bytes,
        })
    }

    async fn client_info(&self) -> Result<ClientInfo, TransportError> {
        let response = self.request(Method::GET, "getIP").send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        let response = response.error_for_status()?;
        let info = response
            .json::<ClientInfo>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        debug!(ip = %info.ip, colo = %info.colo, "Resolved client info");
        Ok(info)
    }
}

fn timing_headers(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    (get(RETRY_AFTER.as_str()), get(SERVER_TIMING))
}

fn random_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::from_entropy();
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    data
}
