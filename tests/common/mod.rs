//! Scripted transport for driving the engine without a network.
//!
//! Each endpoint is a closure from the requested size to a canned response,
//! so a test describes the link it wants and then inspects the calls made.

#![allow(dead_code)]

use async_trait::async_trait;
use cfspeed::speedtest::{ClientInfo, ProbeResponse, Transport, TransportError};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer().with_target(true))
            .with(filter)
            .init();
    });
}

type Script = Box<dyn Fn(u64) -> Result<ProbeResponse, TransportError> + Send + Sync>;
type InfoScript = Box<dyn Fn() -> Result<ClientInfo, TransportError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    ClientInfo,
    Latency,
    Download(u64),
    Upload(u64),
}

pub struct FakeTransport {
    latency: Script,
    download: Script,
    upload: Script,
    client_info: InfoScript,
    calls: Mutex<Vec<Call>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    /// Every endpoint answers 200 with a 30 ms TTFB; bandwidth probes take 500 ms.
    pub fn new() -> Self {
        Self {
            latency: Box::new(|_| Ok(ok(30.0, 0.0))),
            download: Box::new(|_| Ok(ok(30.0, 500.0))),
            upload: Box::new(|_| Ok(ok(500.0, 0.0))),
            client_info: Box::new(|| {
                Ok(ClientInfo {
                    ip: "203.0.113.7".into(),
                    country: "NL".into(),
                    colo: "AMS".into(),
                    org: "Example Net".into(),
                })
            }),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) -> Result<ProbeResponse, TransportError> + Send + Sync + 'static,
    {
        self.latency = Box::new(f);
        self
    }

    pub fn with_download<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) -> Result<ProbeResponse, TransportError> + Send + Sync + 'static,
    {
        self.download = Box::new(f);
        self
    }

    pub fn with_upload<F>(mut self, f: F) -> Self
    where
        F: Fn(u64) -> Result<ProbeResponse, TransportError> + Send + Sync + 'static,
    {
        self.upload = Box::new(f);
        self
    }

    pub fn with_client_info<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<ClientInfo, TransportError> + Send + Sync + 'static,
    {
        self.client_info = Box::new(f);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Download(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Upload(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    pub fn latency_calls(&self) -> usize {
        self.calls().iter().filter(|c| **c == Call::Latency).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn latency(&self) -> Result<ProbeResponse, TransportError> {
        self.record(Call::Latency);
        (self.latency)(0)
    }

    async fn download(&self, bytes: u64) -> Result<ProbeResponse, TransportError> {
        self.record(Call::Download(bytes));
        (self.download)(bytes)
    }

    async fn upload(&self, bytes: u64) -> Result<ProbeResponse, TransportError> {
        self.record(Call::Upload(bytes));
        (self.upload)(bytes)
    }

    async fn client_info(&self) -> Result<ClientInfo, TransportError> {
        self.record(Call::ClientInfo);
        (self.client_info)()
    }
}

/// A 200 with the given timings and no Server-Timing header.
pub fn ok(ttfb_ms: f64, payload_ms: f64) -> ProbeResponse {
    ProbeResponse {
        status: 200,
        ttfb: Duration::from_secs_f64(ttfb_ms / 1000.0),
        payload: Duration::from_secs_f64(payload_ms / 1000.0),
        ..Default::default()
    }
}

pub fn status(code: u16) -> ProbeResponse {
    ProbeResponse {
        status: code,
        ..Default::default()
    }
}
