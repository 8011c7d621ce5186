#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use picproxy::config::{Tally, Upstream};
use picproxy::error::{FetchError, StoreError};
use picproxy::locator::Codec;
use picproxy::proxy::Coordinator;
use picproxy::server::{self, AppState};
use picproxy::storage::{DiskStore, Id, Store};
use picproxy::tally::SessionTally;
use picproxy::upstream::{BoxFuture, Origin, UpstreamClient};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub type Handler = Arc<dyn Fn(usize, &Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync>;

/// Origin stand-in. The handler receives the zero-based hit number.
pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(usize, &Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self::start_delayed(Duration::ZERO, handler).await
    }

    pub async fn start_delayed<F>(delay: Duration, handler: F) -> Self
    where
        F: Fn(usize, &Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler: Handler = Arc::new(handler);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let counter = Arc::clone(&counter);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let hit = counter.fetch_add(1, Ordering::SeqCst);
                                let resp = handler(hit, &req);
                                async move {
                                    if !delay.is_zero() {
                                        tokio::time::sleep(delay).await;
                                    }
                                    Ok::<_, hyper::Error>(resp)
                                }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn respond(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body)));
    *resp.status_mut() = status;
    resp
}

pub fn redirect(location: &str) -> Response<Full<Bytes>> {
    let mut resp = respond(StatusCode::FOUND, b"");
    resp.headers_mut()
        .insert(http::header::LOCATION, location.parse().unwrap());
    resp
}

/// Short backoff so retry tests stay fast.
pub fn fast_upstream(max_attempts: u32) -> Upstream {
    Upstream {
        max_attempts,
        backoff_unit: Duration::from_millis(50),
        attempt_timeout: Duration::from_secs(5),
        ..Upstream::default()
    }
}

pub fn upstream_client(max_attempts: u32) -> UpstreamClient {
    UpstreamClient::new(&fast_upstream(max_attempts)).expect("upstream client")
}

pub fn disk_store(dir: &Path) -> Arc<DiskStore> {
    Arc::new(DiskStore::new(dir.to_path_buf()).expect("disk store"))
}

/// Files under `dir`, recursively.
pub fn count_files(dir: &Path) -> usize {
    let mut n = 0;
    let Ok(entries) = std::fs::read_dir(dir) else { return 0 };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            n += count_files(&path);
        } else {
            n += 1;
        }
    }
    n
}

/// Origin that answers from memory and counts calls.
pub struct FakeOrigin {
    calls: AtomicUsize,
    delay: Duration,
    reply: Result<Bytes, FetchError>,
}

impl FakeOrigin {
    pub fn ok(body: &'static [u8], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            reply: Ok(Bytes::from_static(body)),
        })
    }

    pub fn failing(err: FetchError, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            reply: Err(err),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Origin for FakeOrigin {
    fn fetch(&self, _url: &str) -> BoxFuture<Result<Bytes, FetchError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        let reply = self.reply.clone();
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            reply
        })
    }
}

/// Origin whose fetch future panics.
pub struct PanickingOrigin;

impl Origin for PanickingOrigin {
    fn fetch(&self, _url: &str) -> BoxFuture<Result<Bytes, FetchError>> {
        Box::pin(explode())
    }
}

async fn explode() -> Result<Bytes, FetchError> {
    tokio::time::sleep(Duration::from_millis(20)).await;
    panic!("origin blew up")
}

/// Store that never holds anything and refuses writes.
pub struct BrokenStore;

impl Store for BrokenStore {
    fn exists(&self, _id: &Id) -> bool {
        false
    }

    fn read(&self, _id: &Id) -> Result<Bytes, StoreError> {
        Err(StoreError::NotFound)
    }

    fn write(&self, _id: &Id, _data: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only cache",
        )))
    }
}

pub fn coordinator(store: Arc<dyn Store>, origin: Arc<dyn Origin>) -> Arc<Coordinator> {
    Arc::new(Coordinator::new(store, origin, Duration::ZERO))
}

/// Proxy bound to an ephemeral port; stops when dropped.
pub struct ProxyServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    shutdown: watch::Sender<bool>,
}

impl ProxyServer {
    pub async fn start(coordinator: Arc<Coordinator>, tally: Tally) -> Self {
        let codec = Codec::new(Some(picproxy::config::DEFAULT_URL_ALPHABET)).expect("codec");
        let state = Arc::new(AppState::new(
            coordinator,
            codec,
            Arc::new(SessionTally::new(&tally)),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(server::serve(listener, rx, Arc::clone(&state)));
        Self {
            addr,
            state,
            shutdown,
        }
    }

    pub fn pic_path(&self, origin_url: &str, sid: &str) -> String {
        let codec = Codec::new(Some(picproxy::config::DEFAULT_URL_ALPHABET)).expect("codec");
        let encoded: String =
            url::form_urlencoded::byte_serialize(codec.encode(origin_url).as_bytes()).collect();
        format!("/pic?url={encoded}&sid={sid}")
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        send(self.addr, Method::GET, path, HeaderMap::new(), Bytes::new()).await
    }

    pub async fn post_form(&self, path: &str, form: &str) -> TestResponse {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded".parse().unwrap(),
        );
        send(self.addr, Method::POST, path, headers, Bytes::from(form.to_string())).await
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Clone, Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub async fn send(
    addr: SocketAddr,
    method: Method,
    path: &str,
    headers: HeaderMap,
    body: Bytes,
) -> TestResponse {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect proxy");
    let io = TokioIo::new(stream);
    let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(http::header::HOST, addr.to_string());
    for (k, v) in headers.iter() {
        builder = builder.header(k, v);
    }
    let req = builder.body(Full::new(body)).expect("request");

    let resp = sender.send_request(req).await.expect("send request");
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();

    TestResponse {
        status,
        headers,
        body,
    }
}
