use crate::router::{OutboundPath, Router};
use crate::stats::Stats;
use crate::tunnel::{self, BufferPool};
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use http::uri::{Authority, Parts as UriParts, Scheme, Uri};
use http::{Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body as _, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

const DEFAULT_CONNECT_PORT: u16 = 443;
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Headers that describe one hop, never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

// ============================================================================
// SERVER
// ============================================================================

#[derive(Clone)]
pub struct ProxyServer {
    router: Arc<Router>,
    pool: Arc<BufferPool>,
    stats: Arc<Stats>,
}

impl ProxyServer {
    pub fn new(router: Arc<Router>, pool: Arc<BufferPool>, stats: Arc<Stats>) -> Self {
        Self {
            router,
            pool,
            stats,
        }
    }

    /// Accepts forever, one task per inbound connection.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    // Brief pause so fd exhaustion doesn't spin the loop.
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
            };

            self.stats.total.fetch_add(1, Ordering::Relaxed);
            self.stats.active.fetch_add(1, Ordering::Relaxed);

            let server = self.clone();
            tokio::spawn(async move {
                server.serve_connection(stream, peer).await;
                server.stats.active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);

        let server = self.clone();
        let service = service_fn(move |req| {
            let server = server.clone();
            async move { server.handle(req).await }
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!("Connection from {} ended: {}", peer, e);
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, Infallible> {
        let Some(host) = request_host(&req) else {
            warn!("No target host in request for {}", req.uri());
            return Ok(status_response(StatusCode::BAD_REQUEST, "Bad Request"));
        };

        let path = self.router.select_path(&host);
        self.stats.record_route(path.verdict());

        if req.method() == Method::CONNECT {
            Ok(self.handle_connect(req, path).await)
        } else {
            Ok(self.handle_http(req, path).await)
        }
    }

    // ========================================================================
    // CONNECT
    // ========================================================================

    async fn handle_connect(&self, req: Request<Incoming>, path: &OutboundPath) -> Response<ProxyBody> {
        let Some(target) = connect_target(req.uri()) else {
            warn!("CONNECT target is not host:port: {}", req.uri());
            return status_response(StatusCode::BAD_REQUEST, "Bad Request");
        };

        let upstream = match path.dial(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to destination {}: {}", target, e);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return server_error();
            }
        };

        let pool = self.pool.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    stats.active.fetch_add(1, Ordering::Relaxed);
                    let moved = tunnel::relay(TokioIo::new(upgraded), upstream, &pool).await;
                    stats.record_transfer(moved.client_to_target, moved.target_to_client);
                    stats.active.fetch_sub(1, Ordering::Relaxed);
                    debug!(
                        "Tunnel to {} closed: {}↑ {}↓ bytes",
                        target, moved.client_to_target, moved.target_to_client
                    );
                }
                Err(e) => debug!("Upgrade for {} failed: {}", target, e),
            }
        });

        Response::new(empty())
    }

    // ========================================================================
    // PLAIN HTTP
    // ========================================================================

    async fn handle_http(&self, req: Request<Incoming>, path: &OutboundPath) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();

        let Some(url) = absolute_url(&parts.uri, &parts.headers) else {
            return status_response(StatusCode::BAD_REQUEST, "Bad Request");
        };

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        let mut outbound = path
            .http_client()
            .request(parts.method, url.to_string())
            .headers(headers);
        if !body.is_end_stream() {
            let stats = self.stats.clone();
            let upload = body
                .into_data_stream()
                .inspect_ok(move |chunk| stats.record_transfer(chunk.len() as u64, 0));
            outbound = outbound.body(reqwest::Body::wrap_stream(upload));
        }

        match outbound.send().await {
            Ok(resp) => client_response(resp, self.stats.clone()),
            Err(e) => {
                warn!("Failed to get response from {} via {}: {}", url, path, e);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                server_error()
            }
        }
    }
}

/// Streams the origin's response back, counting body bytes as they pass.
fn client_response(resp: reqwest::Response, stats: Arc<Stats>) -> Response<ProxyBody> {
    let status = resp.status();
    let mut headers = resp.headers().clone();
    strip_hop_by_hop(&mut headers);

    let stream = resp
        .bytes_stream()
        .inspect_ok(move |chunk| stats.record_transfer(0, chunk.len() as u64))
        .map_ok(Frame::data)
        .map_err(|e| Box::new(e) as BoxError);

    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

// ============================================================================
// HELPERS
// ============================================================================

/// Target host from the request URI, falling back to the Host header.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }

    let authority: Authority = req.headers().get(HOST)?.to_str().ok()?.parse().ok()?;
    Some(authority.host().to_string())
}

fn connect_target(uri: &Uri) -> Option<String> {
    let authority = uri.authority()?;
    match authority.port_u16() {
        Some(_) => Some(authority.to_string()),
        None => Some(format!("{}:{}", authority.host(), DEFAULT_CONNECT_PORT)),
    }
}

/// Absolute-form URI of the request; origin-form requests get one built
/// from the Host header.
fn absolute_url(uri: &Uri, headers: &HeaderMap) -> Option<Uri> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Some(uri.clone());
    }

    let authority: Authority = headers.get(HOST)?.to_str().ok()?.parse().ok()?;
    let mut parts = UriParts::default();
    parts.scheme = Some(Scheme::HTTP);
    parts.authority = Some(authority);
    parts.path_and_query = Some(uri.path_and_query()?.clone());
    Uri::from_parts(parts).ok()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn status_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut resp = Response::new(full(message));
    *resp.status_mut() = status;
    resp
}

fn server_error() -> Response<ProxyBody> {
    status_response(StatusCode::INTERNAL_SERVER_ERROR, "Server Error")
}
