use crate::auth::admit_local;
use crate::monitor::GlobalMonitor;
use crate::session::{full, ProxyResponse, SessionError};

use bytes::Bytes;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE, SERVER};
use hyper::{Request, Response, StatusCode};

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const SERVER_NAME: &str = "hproxy";

/// Serves administrative endpoints and static files for requests whose
/// target is the proxy itself. Applies its own admission gate, independent
/// of the proxy credential policy.
pub struct Dispatcher {
    web_root: PathBuf,
    favicon: Bytes,
    echarts: Bytes,
    monitor: Arc<GlobalMonitor>,
    require_auth: bool,
    bypass_header: Option<String>,
}

impl Dispatcher {
    /// Build the dispatcher, loading in-memory assets from the web root.
    /// Missing assets are served as empty bodies rather than failing startup.
    pub fn new(
        web_root: PathBuf,
        monitor: Arc<GlobalMonitor>,
        require_auth: bool,
        bypass_header: Option<String>,
    ) -> Self {
        let favicon = std::fs::read(web_root.join("favicon.ico"))
            .map(Bytes::from)
            .unwrap_or_default();
        let echarts = std::fs::read(web_root.join("echarts.min.js"))
            .map(Bytes::from)
            .unwrap_or_default();
        Self {
            web_root,
            favicon,
            echarts,
            monitor,
            require_auth,
            bypass_header,
        }
    }

    pub async fn handle<B>(
        &self,
        req: &Request<B>,
        peer: SocketAddr,
        if_need_close: bool,
    ) -> Result<ProxyResponse, SessionError> {
        if !admit_local(
            peer.ip(),
            req.headers(),
            self.require_auth,
            self.bypass_header.as_deref(),
        ) {
            warn!(client = %peer.ip(), method = %req.method(), target = %req.uri(), "refused");
            return Err(SessionError::Rejected);
        }
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        info!(client = %peer.ip(), method = %req.method(), target = %req.uri(), host, "local");

        let resp = match req.uri().path() {
            "/favicon.ico" => cached_asset(self.favicon.clone(), "image/vnd.microsoft.icon"),
            "/echarts.min.js" => cached_asset(self.echarts.clone(), "text/javascript"),
            "/ip" => text_response(peer.ip().to_string(), "text/plain; charset=utf-8"),
            "/metrics" => text_response(self.monitor.metrics_text(), "text/plain; charset=utf-8"),
            "/net" => text_response(self.net_html(), "text/html; charset=utf-8"),
            path => return Ok(self.serve_file(path, if_need_close).await),
        };
        Ok(finish(resp, if_need_close))
    }

    /// Map a request path onto the web root; the path is percent-decoded
    /// first, `..` segments (encoded or not) are refused and directory
    /// targets fall back to index.html.
    fn resolve_path(&self, uri_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(uri_path).ok()?;
        let mut path = decoded.trim_start_matches('/').to_string();
        if path.is_empty() || path.ends_with('/') {
            path.push_str("index.html");
        }
        if path.split('/').any(|segment| segment == "..") {
            return None;
        }
        Some(self.web_root.join(path))
    }

    async fn serve_file(&self, uri_path: &str, if_need_close: bool) -> ProxyResponse {
        let Some(path) = self.resolve_path(uri_path) else {
            return not_found();
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut resp = Response::new(full(bytes));
                let headers = resp.headers_mut();
                headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
                headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=1800"));
                if let Ok(value) = HeaderValue::from_str(content_type(&path)) {
                    headers.insert(CONTENT_TYPE, value);
                }
                finish(resp, if_need_close)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => not_found(),
            Err(e) => {
                error!(path = %path.display(), error = %e, "static file read failed");
                internal_error()
            }
        }
    }

    /// HTML traffic dashboard over the rolling sample window
    fn net_html(&self) -> String {
        let samples = self.monitor.samples();
        let mut labels = Vec::new();
        let mut in_rates = Vec::new();
        let mut out_rates = Vec::new();

        for pair in samples.windows(2) {
            let dt = pair[1].at_secs.saturating_sub(pair[0].at_secs).max(1);
            labels.push(pair[1].at_secs);
            in_rates.push(pair[1].bytes_in.saturating_sub(pair[0].bytes_in) / dt);
            out_rates.push(pair[1].bytes_out.saturating_sub(pair[0].bytes_out) / dt);
        }

        format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>net</title>\
             <script src=\"/echarts.min.js\"></script></head><body>\
             <div id=\"net\" style=\"width:100%;height:400px;\"></div>\
             <script>\
             var chart = echarts.init(document.getElementById('net'));\
             chart.setOption({{\
             xAxis:{{type:'category',data:{labels:?}}},\
             yAxis:{{type:'value',name:'bytes/s'}},\
             series:[{{name:'in',type:'line',data:{in_rates:?}}},\
             {{name:'out',type:'line',data:{out_rates:?}}}],\
             legend:{{data:['in','out']}}\
             }});\
             </script></body></html>"
        )
    }
}

fn finish(mut resp: ProxyResponse, if_need_close: bool) -> ProxyResponse {
    if if_need_close {
        resp.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    resp
}

fn text_response(body: String, content_type: &'static str) -> ProxyResponse {
    let mut resp = Response::new(full(body));
    let headers = resp.headers_mut();
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn cached_asset(bytes: Bytes, content_type: &'static str) -> ProxyResponse {
    let mut resp = Response::new(full(bytes));
    let headers = resp.headers_mut();
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=86400"));
    resp
}

fn not_found() -> ProxyResponse {
    let mut resp = Response::new(full("404 not found"));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    let headers = resp.headers_mut();
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    resp
}

fn internal_error() -> ProxyResponse {
    let mut resp = Response::new(full("500 internal server error"));
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    let headers = resp.headers_mut();
    headers.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    resp
}

/// Content type from file extension
fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "css" => "text/css",
        "csv" => "text/csv",
        "gif" => "image/gif",
        "htm" | "html" => "text/html",
        "ico" => "image/vnd.microsoft.icon",
        "jpeg" | "jpg" => "image/jpeg",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "tar" => "application/x-tar",
        "ttf" => "font/ttf",
        "txt" => "text/plain",
        "wasm" => "application/wasm",
        "wav" => "audio/wav",
        "webm" => "video/webm",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "bin" => "application/octet-stream",
        _ => "text/plain",
    }
}
