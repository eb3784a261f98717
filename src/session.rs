use crate::auth::{admit_proxy, CredentialStore};
use crate::buffer_pool::{get_buffer, return_buffer};
use crate::upstream::UpstreamConnector;
use crate::web::Dispatcher;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, HOST, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Session-level failures. `Rejected` and `Malformed` resolve the service
/// future with an error so the connection closes without any response bytes.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("rejected by admission gate")]
    Rejected,

    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Http(#[from] hyper::Error),
}

/// What the first request asks the proxy to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// CONNECT-initiated raw byte relay
    Tunnel { host: String, port: u16 },
    /// Absolute-form HTTP request relayed to an origin
    Forward { host: String, port: u16 },
    /// Request targeting the proxy itself
    Local,
}

/// Split a `host[:port]` or `[v6addr][:port]` target, with a default port
/// for targets that omit one.
fn split_host_port(target: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }
    match target.rsplit_once(':') {
        Some((host, p)) => Some((host.to_string(), p.parse().ok()?)),
        None => Some((target.to_string(), default_port)),
    }
}

/// Classify a request, evaluated in order: CONNECT, absolute-form, local.
pub fn classify<B>(req: &Request<B>) -> Result<Classification, SessionError> {
    if req.method() == Method::CONNECT {
        // A portless CONNECT target parses as a path-form URI, so take the
        // authority when present and fall back to the raw path otherwise
        let target = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => req.uri().path().to_string(),
        };
        if target.is_empty() || target == "/" {
            return Err(SessionError::Malformed("CONNECT target is not host:port"));
        }
        // No explicit port on a CONNECT target means TLS
        let (host, port) = split_host_port(&target, 443)
            .ok_or(SessionError::Malformed("unparsable CONNECT target"))?;
        return Ok(Classification::Tunnel { host, port });
    }

    if req.uri().scheme().is_some() {
        let host = req
            .uri()
            .host()
            .ok_or(SessionError::Malformed("absolute URI without host"))?
            .to_string();
        return Ok(Classification::Forward {
            host,
            port: req.uri().port_u16().unwrap_or(80),
        });
    }

    Ok(Classification::Local)
}

/// Persistence decision from the inbound request's version and Connection
/// header: HTTP/1.0 closes unless keep-alive is explicit, HTTP/1.1 keeps
/// alive unless close is explicit.
pub fn want_keep_alive<B>(req: &Request<B>) -> bool {
    let connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    match req.version() {
        Version::HTTP_10 => connection.contains("keep-alive"),
        _ => !connection.contains("close"),
    }
}

/// Per-connection hand-off state shared between the service and the
/// connection task: the tunnel task handle, when a CONNECT upgrade spawned
/// one, so teardown can wait for the splice to finish.
#[derive(Debug, Default)]
pub struct ConnContext {
    tunnel: Mutex<Option<JoinHandle<()>>>,
}

impl ConnContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_tunnel(&self, handle: JoinHandle<()>) {
        let mut slot = match self.tunnel.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handle);
    }

    pub fn take_tunnel(&self) -> Option<JoinHandle<()>> {
        let mut slot = match self.tunnel.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take()
    }
}

/// Drives one inbound connection: classifies the first request,
/// authenticates, and branches to a tunnel, a forward relay, or the local
/// dispatcher.
pub struct SessionEngine {
    credentials: Arc<CredentialStore>,
    connector: UpstreamConnector,
    dispatcher: Arc<Dispatcher>,
    require_auth: bool,
    bypass_header: Option<String>,
    idle_timeout: Duration,
}

impl SessionEngine {
    pub fn new(
        credentials: Arc<CredentialStore>,
        connector: UpstreamConnector,
        dispatcher: Arc<Dispatcher>,
        require_auth: bool,
        bypass_header: Option<String>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            connector,
            dispatcher,
            require_auth,
            bypass_header,
            idle_timeout,
        }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        ctx: Arc<ConnContext>,
    ) -> Result<ProxyResponse, SessionError> {
        let if_need_close = !want_keep_alive(&req);

        match classify(&req)? {
            Classification::Local => {
                if req.headers().get(HOST).is_none() {
                    return Err(SessionError::Malformed("missing Host header"));
                }
                self.dispatcher.handle(&req, peer, if_need_close).await
            }
            Classification::Tunnel { host, port } => {
                self.admit(&req, peer, &host, port)?;
                self.tunnel(req, host, port, ctx).await
            }
            Classification::Forward { host, port } => {
                self.admit(&req, peer, &host, port)?;
                self.forward(req, host, port, if_need_close).await
            }
        }
    }

    /// Admission gate for tunnel and forward requests. Rejections close the
    /// connection silently; admitted requests are logged before branching.
    fn admit<B>(
        &self,
        req: &Request<B>,
        peer: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<(), SessionError> {
        if !admit_proxy(
            peer.ip(),
            req.headers(),
            self.require_auth,
            self.bypass_header.as_deref(),
            &self.credentials,
        ) {
            warn!(
                client = %peer.ip(),
                method = %req.method(),
                target = %req.uri(),
                host = %host,
                port,
                "refused"
            );
            return Err(SessionError::Rejected);
        }
        info!(
            client = %peer.ip(),
            method = %req.method(),
            target = %req.uri(),
            host = %host,
            port,
            "admitted"
        );
        Ok(())
    }

    /// CONNECT path: open the upstream first so a connect failure can still
    /// be reported to the client, then answer 200 and hand the upgraded
    /// stream to a splice task.
    async fn tunnel(
        &self,
        req: Request<Incoming>,
        host: String,
        port: u16,
        ctx: Arc<ConnContext>,
    ) -> Result<ProxyResponse, SessionError> {
        let upstream = match self.connector.connect(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(host = %host, port, error = %e, "upstream connect failed");
                return Ok(error_response(
                    StatusCode::BAD_GATEWAY,
                    "upstream connect failed",
                ));
            }
        };

        let idle_timeout = self.idle_timeout;
        let handle = tokio::task::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    if let Err(e) = splice(client, upstream, idle_timeout).await {
                        warn!("tunnel io error: {}", e);
                    }
                }
                Err(e) => warn!("upgrade error: {}", e),
            }
        });
        ctx.set_tunnel(handle);

        Ok(Response::new(empty()))
    }

    /// Forward path: strip proxy-specific headers, rewrite the target to
    /// origin-form, relay the request and pass the response back with its
    /// connection-control framing normalized to the inbound decision.
    async fn forward(
        &self,
        mut req: Request<Incoming>,
        host: String,
        port: u16,
        if_need_close: bool,
    ) -> Result<ProxyResponse, SessionError> {
        let upstream = match self.connector.connect(&host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(host = %host, port, error = %e, "upstream connect failed");
                return Ok(error_response(
                    StatusCode::BAD_GATEWAY,
                    "upstream connect failed",
                ));
            }
        };

        req.headers_mut().remove(PROXY_AUTHORIZATION);
        req.headers_mut().remove("proxy-connection");
        if let Some(name) = &self.bypass_header {
            req.headers_mut().remove(name.as_str());
        }

        let origin_form = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        *req.uri_mut() = origin_form
            .parse()
            .map_err(|_| SessionError::Malformed("unparsable request target"))?;

        req.headers_mut()
            .insert(CONNECTION, connection_value(if_need_close));

        let io = TokioIo::new(upstream);
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await?;

        // Drive the upstream connection until the response body completes
        tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                if !err.to_string().contains("connection closed") {
                    warn!("upstream connection error: {:?}", err);
                }
            }
        });

        let mut resp = sender.send_request(req).await?;
        resp.headers_mut()
            .insert(CONNECTION, connection_value(if_need_close));

        Ok(resp.map(|b| b.boxed()))
    }
}

fn connection_value(if_need_close: bool) -> HeaderValue {
    if if_need_close {
        HeaderValue::from_static("close")
    } else {
        HeaderValue::from_static("keep-alive")
    }
}

pub(crate) fn error_response(status: StatusCode, msg: &'static str) -> ProxyResponse {
    let mut resp = Response::new(full(msg));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    resp
}

pub(crate) fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Verbatim bidirectional byte relay with idle supervision.
///
/// Runs until either side closes, either side errors, or the idle window
/// elapses with no traffic; both directions then terminate together.
/// Returns (bytes client→upstream, bytes upstream→client).
pub(crate) async fn splice<A, B>(
    mut client: A,
    mut upstream: B,
    idle_timeout: Duration,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = get_buffer().await;
    let mut upstream_buf = get_buffer().await;
    let mut from_client = 0u64;
    let mut from_upstream = 0u64;
    let mut error: Option<std::io::Error> = None;

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            res = client.read(&mut client_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = upstream.write_all(&client_buf[..n]).await {
                            error = Some(e);
                            break;
                        }
                        from_client += n as u64;
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
            res = upstream.read(&mut upstream_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = client.write_all(&upstream_buf[..n]).await {
                            error = Some(e);
                            break;
                        }
                        from_upstream += n as u64;
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
            _ = &mut idle => break,
        }
    }

    // Both directions terminate together: flush pending writes, then close
    let _ = upstream.shutdown().await;
    let _ = client.shutdown().await;

    return_buffer(client_buf).await;
    return_buffer(upstream_buf).await;

    match error {
        Some(e) => Err(e),
        None => Ok((from_client, from_upstream)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn request(method: Method, uri: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Empty::new())
            .unwrap()
    }

    #[test]
    fn connect_classifies_as_tunnel() {
        let req = request(Method::CONNECT, "example.com:8443");
        assert_eq!(
            classify(&req).unwrap(),
            Classification::Tunnel {
                host: "example.com".to_string(),
                port: 8443
            }
        );
    }

    #[test]
    fn connect_without_port_defaults_to_443() {
        let req = request(Method::CONNECT, "example.com");
        assert_eq!(
            classify(&req).unwrap(),
            Classification::Tunnel {
                host: "example.com".to_string(),
                port: 443
            }
        );
    }

    #[test]
    fn absolute_form_classifies_as_forward() {
        let req = request(Method::GET, "http://example.com/path?q=1");
        assert_eq!(
            classify(&req).unwrap(),
            Classification::Forward {
                host: "example.com".to_string(),
                port: 80
            }
        );
    }

    #[test]
    fn absolute_form_keeps_explicit_port() {
        let req = request(Method::GET, "http://example.com:8080/");
        assert_eq!(
            classify(&req).unwrap(),
            Classification::Forward {
                host: "example.com".to_string(),
                port: 8080
            }
        );
    }

    #[test]
    fn relative_form_classifies_as_local() {
        let req = request(Method::GET, "/metrics");
        assert_eq!(classify(&req).unwrap(), Classification::Local);
    }

    #[test]
    fn keep_alive_follows_version_and_header() {
        let req = request(Method::GET, "/");
        assert!(want_keep_alive(&req));

        let req = Request::builder()
            .uri("/")
            .header(CONNECTION, "close")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(!want_keep_alive(&req));

        let req = Request::builder()
            .uri("/")
            .version(Version::HTTP_10)
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(!want_keep_alive(&req));

        let req = Request::builder()
            .uri("/")
            .version(Version::HTTP_10)
            .header(CONNECTION, "keep-alive")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert!(want_keep_alive(&req));
    }

    #[test]
    fn ipv6_connect_targets_are_split_on_the_bracket() {
        assert_eq!(
            split_host_port("[::1]:8443", 443),
            Some(("::1".to_string(), 8443))
        );
        assert_eq!(split_host_port("[::1]", 443), Some(("::1".to_string(), 443)));
        assert_eq!(split_host_port("example.com:x", 443), None);
    }

    #[tokio::test]
    async fn splice_relays_bytes_verbatim_in_both_directions() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, mut upstream_far) = duplex(1024);

        let relay = tokio::spawn(splice(client_near, upstream_near, Duration::from_secs(5)));

        client_far.write_all(b"ping from client").await.unwrap();
        let mut buf = [0u8; 16];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping from client");

        upstream_far.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Client close ends the relay; the upstream side sees EOF too
        drop(client_far);
        let (from_client, from_upstream) = relay.await.unwrap().unwrap();
        assert_eq!(from_client, 16);
        assert_eq!(from_upstream, 4);

        let n = upstream_far.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn splice_ends_on_idle_timeout() {
        let (client_near, _client_far) = duplex(64);
        let (upstream_near, _upstream_far) = duplex(64);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            splice(client_near, upstream_near, Duration::from_millis(50)),
        )
        .await
        .expect("relay should end on idle timeout");

        let (a, b) = result.unwrap();
        assert_eq!((a, b), (0, 0));
    }

    #[tokio::test]
    async fn tunnel_context_hands_off_once() {
        let ctx = ConnContext::new();
        assert!(ctx.take_tunnel().is_none());

        ctx.set_tunnel(tokio::spawn(async {}));
        assert!(ctx.take_tunnel().is_some());
        assert!(ctx.take_tunnel().is_none());
    }

    #[test]
    fn error_responses_request_close() {
        let resp = error_response(StatusCode::BAD_GATEWAY, "nope");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            resp.headers().get(CONNECTION).unwrap().to_str().unwrap(),
            "close"
        );
    }
}
