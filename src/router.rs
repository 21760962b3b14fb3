use crate::rules::{RouteVerdict, RuleStore};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum DialError {
    #[error("connect to {target} failed: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SOCKS5 connect to {target} via {proxy} failed: {source}")]
    Socks {
        target: String,
        proxy: String,
        #[source]
        source: tokio_socks::Error,
    },

    #[error("connect to {target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Byte stream to a dialed target, whatever route it took.
pub trait TargetStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TargetStream for T {}

pub type BoxedStream = Box<dyn TargetStream>;

#[derive(Clone, PartialEq, Eq)]
enum Route {
    Direct,
    Socks5 { proxy: String },
}

/// One way of reaching remote hosts: a raw dialer for tunnels and a pooled
/// HTTP client for plain requests, both bound to the same route.
pub struct OutboundPath {
    route: Route,
    http: reqwest::Client,
    connect_timeout: Duration,
}

impl OutboundPath {
    pub fn direct(connect_timeout: Duration) -> Result<Self, DialError> {
        let http = client_builder(connect_timeout).no_proxy().build()?;
        Ok(Self {
            route: Route::Direct,
            http,
            connect_timeout,
        })
    }

    pub fn socks5(proxy: impl Into<String>, connect_timeout: Duration) -> Result<Self, DialError> {
        let proxy = proxy.into();
        // socks5h: the upstream resolves names, local DNS may be poisoned.
        let http = client_builder(connect_timeout)
            .proxy(reqwest::Proxy::all(format!("socks5h://{}", proxy))?)
            .build()?;
        Ok(Self {
            route: Route::Socks5 { proxy },
            http,
            connect_timeout,
        })
    }

    pub fn verdict(&self) -> RouteVerdict {
        match self.route {
            Route::Direct => RouteVerdict::Direct,
            Route::Socks5 { .. } => RouteVerdict::Proxied,
        }
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Opens a raw connection to `target` (`host:port`). The whole connect,
    /// SOCKS5 handshake included, is bounded by the connect timeout.
    pub async fn dial(&self, target: &str) -> Result<BoxedStream, DialError> {
        let timed_out = || DialError::Timeout {
            target: target.to_string(),
            after: self.connect_timeout,
        };

        match &self.route {
            Route::Direct => {
                let stream = timeout(self.connect_timeout, TcpStream::connect(target))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|source| DialError::Io {
                        target: target.to_string(),
                        source,
                    })?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            Route::Socks5 { proxy } => {
                let stream = timeout(self.connect_timeout, Socks5Stream::connect(proxy.as_str(), target))
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|source| DialError::Socks {
                        target: target.to_string(),
                        proxy: proxy.clone(),
                        source,
                    })?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
        }
    }
}

impl fmt::Display for OutboundPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.route {
            Route::Direct => write!(f, "direct"),
            Route::Socks5 { proxy } => write!(f, "socks5://{}", proxy),
        }
    }
}

fn client_builder(connect_timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .tcp_keepalive(TCP_KEEPALIVE)
}

/// Maps hostnames to outbound paths using the live rules.
pub struct Router {
    rules: Arc<RuleStore>,
    direct: OutboundPath,
    proxied: OutboundPath,
}

impl Router {
    pub fn new(rules: Arc<RuleStore>, socks5_addr: &str, connect_timeout: Duration) -> Result<Self, DialError> {
        Ok(Self {
            rules,
            direct: OutboundPath::direct(connect_timeout)?,
            proxied: OutboundPath::socks5(socks5_addr, connect_timeout)?,
        })
    }

    pub fn classify(&self, host: &str) -> RouteVerdict {
        self.rules.classify(host)
    }

    pub fn select_path(&self, host: &str) -> &OutboundPath {
        let path = match self.classify(host) {
            RouteVerdict::Direct => &self.direct,
            RouteVerdict::Proxied => &self.proxied,
        };
        debug!("{} -> {}", host, path);
        path
    }

    pub fn proxied(&self) -> &OutboundPath {
        &self.proxied
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleSet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    fn router() -> Router {
        let rules = Arc::new(RuleStore::new());
        rules.replace_blocklist(RuleSet::new(["blocked.example"]));
        rules.replace_custom_list(RuleSet::new(["mine.internal"]));
        Router::new(rules, "127.0.0.1:1080", CONNECT_TIMEOUT).unwrap()
    }

    #[test]
    fn test_select_path_follows_verdict() {
        let router = router();

        assert_eq!(router.select_path("www.blocked.example").verdict(), RouteVerdict::Proxied);
        assert_eq!(router.select_path("mine.internal").verdict(), RouteVerdict::Proxied);
        assert_eq!(router.select_path("open.example").verdict(), RouteVerdict::Direct);
        assert_eq!(router.proxied().to_string(), "socks5://127.0.0.1:1080");
    }

    #[test]
    fn test_verdict_tracks_rule_replacement() {
        let router = router();
        assert_eq!(router.classify("news.example"), RouteVerdict::Direct);

        router.rules().replace_blocklist(RuleSet::new(["news.example"]));
        assert_eq!(router.classify("news.example"), RouteVerdict::Proxied);
    }

    #[tokio::test]
    async fn test_direct_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"ok").await.unwrap();
        });

        let path = OutboundPath::direct(CONNECT_TIMEOUT).unwrap();
        let mut stream = path.dial(&addr.to_string()).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_socks5_dial_failure_does_not_fall_back() {
        // Reserve a port, then free it so nothing is listening there.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();

        let path = OutboundPath::socks5(dead.to_string(), CONNECT_TIMEOUT).unwrap();
        let err = match path.dial(&target_addr.to_string()).await {
            Ok(_) => panic!("dial through a dead upstream should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, DialError::Socks { .. }));
    }

    #[tokio::test]
    async fn test_socks5_dial_times_out_on_silent_upstream() {
        // Accepts the TCP connection, then never answers the greeting.
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = upstream.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let path = OutboundPath::socks5(upstream_addr.to_string(), Duration::from_millis(200)).unwrap();
        let err = match tokio::time::timeout(Duration::from_secs(5), path.dial("blocked.example:443"))
            .await
            .expect("dial was not bounded by the connect timeout")
        {
            Ok(_) => panic!("dial through a silent upstream should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, DialError::Timeout { .. }), "unexpected error: {}", err);
    }
}
