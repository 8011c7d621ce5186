use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Bootstrap;
use crate::constants;
use crate::locator::{self, Codec};
use crate::logging;
use crate::metrics;
use crate::proxy::Coordinator;
use crate::runtime;
use crate::storage::{DiskStore, Id};
use crate::tally::{SessionTally, Verdict};
use crate::upstream::UpstreamClient;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct AppState {
    coordinator: Arc<Coordinator>,
    codec: Codec,
    tally: Arc<SessionTally>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, codec: Codec, tally: Arc<SessionTally>) -> Self {
        Self {
            coordinator,
            codec,
            tally,
        }
    }

    pub fn from_config(cfg: &Bootstrap) -> Result<Self> {
        let store = DiskStore::new(cfg.storage.path.clone())?;
        log::info!("cache dir: {}", store.path().display());
        let upstream = UpstreamClient::new(&cfg.upstream)?;
        let coordinator = Coordinator::new(
            Arc::new(store),
            Arc::new(upstream),
            cfg.coordinator.failure_cooldown,
        );
        let codec = Codec::new(cfg.server.alphabet()).context("server.url_alphabet")?;
        Ok(Self::new(
            Arc::new(coordinator),
            codec,
            Arc::new(SessionTally::new(&cfg.tally)),
        ))
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn tally(&self) -> &Arc<SessionTally> {
        &self.tally
    }
}

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let state = Arc::new(AppState::from_config(&cfg)?);
    let listener = bind_listener(&cfg.server.addr).await?;
    log::info!("listening on {}", listener.local_addr().context("local addr")?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);
    serve(listener, shutdown_rx, state).await
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr.parse().context("parse server.addr")?;
    TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("bind {socket_addr}"))
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let terminate = async {
            match sigterm.as_mut() {
                Some(sig) => {
                    sig.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate => {}
        }
        log::info!("shutdown signal received");
        let _ = shutdown.send(true);
    });
}

pub async fn serve(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
) -> Result<()> {
    runtime::mark_started();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                log::trace!("accepted connection from {peer}");
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(req: Request<Incoming>, state: Arc<AppState>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let request_id = metrics::request_id(req.headers());
    let mut resp = logging::in_request_scope(request_id.clone(), route(req, state)).await;
    if let Ok(val) = request_id.parse() {
        resp.headers_mut().insert(constants::PROTOCOL_REQUEST_ID_KEY, val);
    }
    metrics::record(resp.status());
    Ok(resp)
}

async fn route(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    let params = query_params(&req);
    match path.as_str() {
        constants::PIC_PATH => handle_pic(&params, &state).await,
        constants::JOB_PATH => handle_job(req, &state).await,
        constants::REFRESH_PATH => handle_refresh(&params, &state).await,
        "/healthz" => text_response(StatusCode::OK, "ok"),
        "/version" => json_response(&runtime::process_info(state.coordinator.inflight())),
        "/metrics" => text_response(StatusCode::OK, &metrics::render()),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn handle_pic(params: &HashMap<String, String>, state: &AppState) -> Response<Full<Bytes>> {
    let sid = params.get(constants::PARAM_SESSION).map(String::as_str).unwrap_or("");
    let raw = params.get(constants::PARAM_URL).map(String::as_str).unwrap_or("");
    let url = match state.codec.decode(raw) {
        Ok(url) => url,
        Err(err) => {
            log::info!("param decode error, param coded: {raw:?} error: {err}");
            return text_response(StatusCode::BAD_REQUEST, "param error");
        }
    };
    let id = Id::derive(&url);
    log::info!("requesting pic id: {id}");

    match state.coordinator.serve(&id, &url).await {
        Ok((data, status)) => {
            state.tally.record(sid, true);
            log::info!("serve pic done, id: {id} cache: {}", status.as_str());
            Response::builder()
                .status(StatusCode::OK)
                .header(http::header::CONTENT_TYPE, sniff_content_type(&data))
                .header(constants::PROTOCOL_CACHE_STATUS_KEY, status.as_str())
                .body(Full::new(data))
                .unwrap_or_else(|_| empty_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
        Err(err) => {
            state.tally.record(sid, false);
            log::warn!("serve pic failed, id: {id} error: {err}");
            empty_response(err.status_code())
        }
    }
}

async fn handle_job(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    if req.method() != Method::POST {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "POST required");
    }
    let body = match req.into_body().collect().await {
        Ok(body) => body.to_bytes(),
        Err(err) => {
            log::warn!("read job body failed: {err}");
            return text_response(StatusCode::BAD_REQUEST, "bad body");
        }
    };
    let mut urls = Vec::new();
    for (key, val) in url::form_urlencoded::parse(&body) {
        if key != constants::PARAM_URL {
            continue;
        }
        match locator::normalize(&val) {
            Ok(url) => urls.push(url),
            Err(locator::LocatorError::Missing) => {}
            Err(err) => log::warn!("job url skipped: {err}"),
        }
    }
    let count = state.coordinator.prefetch(urls);
    log::info!("job received, {count} urls");
    text_response(StatusCode::OK, constants::JOB_ACK)
}

async fn handle_refresh(params: &HashMap<String, String>, state: &AppState) -> Response<Full<Bytes>> {
    let sid = params.get(constants::PARAM_SESSION).map(String::as_str).unwrap_or("");
    let body = match state.tally.wait_verdict(sid).await {
        Verdict::Reload => constants::REFRESH_RELOAD,
        Verdict::Normal => constants::REFRESH_NORMAL,
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/javascript; charset=utf-8")
        .header(http::header::CACHE_CONTROL, "no-store")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap_or_else(|_| empty_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn query_params(req: &Request<Incoming>) -> HashMap<String, String> {
    let query = req.uri().query().unwrap_or("");
    // First value wins, like a form lookup.
    let mut params = HashMap::new();
    for (key, val) in url::form_urlencoded::parse(query.as_bytes()) {
        params.entry(key.into_owned()).or_insert_with(|| val.into_owned());
    }
    params
}

/// Content type guessed from the leading bytes; nothing is stored with the entry.
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"BM", "image/bmp"),
        (b"\x00\x00\x01\x00", "image/x-icon"),
    ];
    for (magic, mime) in SIGNATURES {
        if data.starts_with(magic) {
            return mime;
        }
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    let head = &data[..data.len().min(256)];
    let head = String::from_utf8_lossy(head);
    let head = head.trim_start();
    if head.starts_with("<svg") || (head.starts_with("<?xml") && head.contains("<svg")) {
        return "image/svg+xml";
    }
    "application/octet-stream"
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

fn json_response<T: serde::Serialize>(payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            let mut resp = Response::new(Full::new(Bytes::from(bytes)));
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json; charset=utf-8"),
            );
            resp
        }
        Err(_) => text_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode"),
    }
}
