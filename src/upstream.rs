use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::config;
use crate::constants::MAX_REDIRECTS;
use crate::error::FetchError;
use crate::metrics;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Source of cache entries. The coordinator only ever talks to this seam.
pub trait Origin: Send + Sync {
    fn fetch(&self, url: &str) -> BoxFuture<Result<Bytes, FetchError>>;
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
    pub attempt_timeout: Duration,
    pub terminal_status: Vec<StatusCode>,
}

impl RetryPolicy {
    pub fn from_config(cfg: &config::Upstream) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff_unit: cfg.backoff_unit,
            attempt_timeout: cfg.attempt_timeout,
            terminal_status: cfg
                .terminal_status
                .iter()
                .filter_map(|code| StatusCode::from_u16(*code).ok())
                .collect(),
        }
    }

    /// Linear backoff: the n-th failed attempt waits `n * backoff_unit`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }

    fn is_terminal(&self, status: StatusCode) -> bool {
        self.terminal_status.contains(&status)
    }
}

enum Attempt {
    Body(Bytes),
    Empty,
    Terminal(StatusCode),
    Transient(String),
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    policy: RetryPolicy,
    user_agent: Option<HeaderValue>,
    max_conns_per_host: Option<usize>,
    host_limits: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl UpstreamClient {
    pub fn new(cfg: &config::Upstream) -> Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);
        let provider = rustls::crypto::ring::default_provider();
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(provider)
            .map_err(|err| anyhow!("upstream tls: {err}"))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(connector);
        let mut builder = Client::builder(TokioExecutor::new());
        if cfg.max_idle_conns_per_host > 0 {
            builder.pool_max_idle_per_host(cfg.max_idle_conns_per_host);
        }
        let user_agent = match cfg.user_agent.as_deref() {
            Some(ua) => Some(HeaderValue::from_str(ua).map_err(|_| anyhow!("invalid upstream.user_agent"))?),
            None => None,
        };
        Ok(Self {
            client: builder.build(https),
            policy: RetryPolicy::from_config(cfg),
            user_agent,
            max_conns_per_host: (cfg.max_connections_per_server > 0)
                .then_some(cfg.max_connections_per_server),
            host_limits: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// GET `url` with bounded retries. Terminal statuses and empty bodies end
    /// the loop at once; anything else is retried after a growing backoff.
    pub async fn fetch_with_retry(&self, url: &str) -> Result<Bytes, FetchError> {
        let start = Url::parse(url).map_err(|err| FetchError::MalformedInput(format!("{url}: {err}")))?;
        let max = self.policy.max_attempts;
        let mut last_reason = String::new();
        for attempt in 1..=max {
            let outcome = match tokio::time::timeout(self.policy.attempt_timeout, self.attempt(&start)).await {
                Ok(outcome) => outcome,
                Err(_) => Attempt::Transient(format!("timeout after {:?}", self.policy.attempt_timeout)),
            };
            match outcome {
                Attempt::Body(body) => {
                    metrics::record_origin_attempt("ok");
                    log::info!("origin fetch done, url: {url} size: {} attempt: {attempt}", body.len());
                    return Ok(body);
                }
                Attempt::Empty => {
                    metrics::record_origin_attempt("empty");
                    log::warn!("origin returned empty body, url: {url}");
                    return Err(FetchError::EmptyBody);
                }
                Attempt::Terminal(status) => {
                    metrics::record_origin_attempt("terminal");
                    log::warn!("origin fetch failed, url: {url} status: {status}, not retrying");
                    return Err(FetchError::OriginTerminal { status });
                }
                Attempt::Transient(reason) => {
                    metrics::record_origin_attempt("transient");
                    if attempt < max {
                        let wait = self.policy.backoff(attempt);
                        log::warn!(
                            "origin fetch failed, url: {url} reason: {reason}, retry {}/{} in {:?}",
                            attempt + 1,
                            max,
                            wait
                        );
                        tokio::time::sleep(wait).await;
                    } else {
                        log::warn!("origin fetch failed, url: {url} reason: {reason}, giving up");
                    }
                    last_reason = reason;
                }
            }
        }
        Err(FetchError::OriginTransient {
            attempts: max,
            reason: last_reason,
        })
    }

    async fn attempt(&self, start: &Url) -> Attempt {
        let mut current = start.clone();
        for _ in 0..=MAX_REDIRECTS {
            let uri = match current.as_str().parse::<Uri>() {
                Ok(uri) => uri,
                Err(err) => return Attempt::Transient(format!("invalid uri {current}: {err}")),
            };
            let _host_permit = self.acquire_host_limit(&uri).await;
            let resp = match self.send(uri).await {
                Ok(resp) => resp,
                Err(reason) => return Attempt::Transient(reason),
            };
            let status = resp.status();
            if status.is_redirection() {
                if let Some(next) = redirect_target(&current, resp.headers()) {
                    drop(resp);
                    log::debug!("origin redirect {status} -> {next}");
                    current = next;
                    continue;
                }
            }
            if status.is_success() {
                return match collect_body(resp).await {
                    Ok(body) if body.is_empty() => Attempt::Empty,
                    Ok(body) => Attempt::Body(body),
                    Err(reason) => Attempt::Transient(reason),
                };
            }
            drop(resp);
            if self.policy.is_terminal(status) {
                return Attempt::Terminal(status);
            }
            return Attempt::Transient(format!("status {status}"));
        }
        Attempt::Transient(format!("more than {MAX_REDIRECTS} redirects"))
    }

    async fn send(&self, uri: Uri) -> std::result::Result<http::Response<Incoming>, String> {
        let mut req = http::Request::builder().method(Method::GET).uri(uri);
        if let Some(ua) = &self.user_agent {
            req = req.header(http::header::USER_AGENT, ua.clone());
        }
        let req = req
            .body(Full::new(Bytes::new()))
            .map_err(|err| format!("build request: {err}"))?;
        self.client
            .request(req)
            .await
            .map_err(|err| format!("request: {err}"))
    }

    async fn acquire_host_limit(&self, uri: &Uri) -> Option<OwnedSemaphorePermit> {
        let limit = self.max_conns_per_host?;
        let key = uri.authority()?.as_str().to_string();
        let sem = {
            let mut map = self.host_limits.lock().ok()?;
            map.entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                .clone()
        };
        sem.acquire_owned().await.ok()
    }
}

impl Origin for UpstreamClient {
    fn fetch(&self, url: &str) -> BoxFuture<Result<Bytes, FetchError>> {
        let client = self.clone();
        let url = url.to_string();
        Box::pin(async move { client.fetch_with_retry(&url).await })
    }
}

fn redirect_target(current: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(http::header::LOCATION)?.to_str().ok()?;
    let next = current.join(location).ok()?;
    matches!(next.scheme(), "http" | "https").then_some(next)
}

async fn collect_body(resp: http::Response<Incoming>) -> std::result::Result<Bytes, String> {
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(|err| format!("read body: {err}"))?;
    Ok(body.to_bytes())
}
