//! Prometheus collectors exposed on `/metrics`, plus request id handling.

use std::sync::OnceLock;

use http::{HeaderMap, StatusCode};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::constants;

struct Collectors {
    registry: Registry,
    requests: IntCounterVec,
    lookups: IntCounterVec,
    origin_attempts: IntCounterVec,
    fills: IntCounterVec,
    prefetch_urls: IntCounterVec,
    inflight: IntGauge,
}

impl Collectors {
    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("picproxy".to_string()), None)?;
        let counter = |name: &str, help: &str, label: &str| -> prometheus::Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help), &[label])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };
        let requests = counter("requests_total", "HTTP requests by status code", "code")?;
        let lookups = counter("cache_lookups_total", "Cache lookups by result", "result")?;
        let origin_attempts =
            counter("origin_attempts_total", "Origin fetch attempts by outcome", "outcome")?;
        let fills = counter("fill_results_total", "Finished fetch cycles by result", "result")?;
        let prefetch_urls = counter("prefetch_urls_total", "URLs accepted by /job", "source")?;
        let inflight = IntGauge::new("inflight_fetches", "Fetch cycles currently running")?;
        registry.register(Box::new(inflight.clone()))?;
        Ok(Self {
            registry,
            requests,
            lookups,
            origin_attempts,
            fills,
            prefetch_urls,
            inflight,
        })
    }
}

fn collectors() -> &'static Collectors {
    static COLLECTORS: OnceLock<Collectors> = OnceLock::new();
    COLLECTORS.get_or_init(|| Collectors::build().expect("metric names are static and unique"))
}

pub fn record(status: StatusCode) {
    collectors()
        .requests
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    collectors().lookups.with_label_values(&[result]).inc();
}

pub fn record_origin_attempt(outcome: &str) {
    collectors()
        .origin_attempts
        .with_label_values(&[outcome])
        .inc();
}

pub fn record_fill(result: &str) {
    collectors().fills.with_label_values(&[result]).inc();
}

pub fn record_prefetch(count: usize) {
    collectors()
        .prefetch_urls
        .with_label_values(&["job"])
        .inc_by(count as u64);
}

/// Counts one running fetch cycle for as long as it is alive.
pub struct InflightGuard(());

impl InflightGuard {
    pub fn new() -> Self {
        collectors().inflight.inc();
        Self(())
    }
}

impl Default for InflightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        collectors().inflight.dec();
    }
}

/// Text exposition of every collector.
pub fn render() -> String {
    let families = collectors().registry.gather();
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&families, &mut buf) {
        log::warn!("encode metrics: {err}");
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// Caller supplied `X-Request-ID`, or a fresh random one.
pub fn request_id(headers: &HeaderMap) -> String {
    match headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
    {
        Some(rid) if !rid.is_empty() => rid.to_string(),
        _ => new_request_id(),
    }
}

pub fn new_request_id() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}
