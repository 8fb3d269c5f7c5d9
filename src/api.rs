//! HTTP control API
//!
//! Maps routes onto [`ControlService`] operations:
//!
//! - `GET /health`, `GET /version`
//! - `GET|POST /api/proxy/servers`
//! - `GET|POST|PUT|DELETE /api/proxy/servers/{id}`
//! - `POST /api/proxy/run`, `POST /api/proxy/kill`
//! - `GET /api/proxy/running`, `GET /api/proxy/status`
//! - `GET /api/proxy/logs/access?limit=N`

use crate::error::{json_error_response, ApiErrorCode, ServiceError};
use crate::service::{ControlService, DEFAULT_LOG_LIMIT};
use crate::store::ServerRecord;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const SERVERS_PATH: &str = "/api/proxy/servers";

type Result<T> = anyhow::Result<T>;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_ok<T: serde::Serialize>(value: &T) -> Result<Response<Full<Bytes>>> {
    Ok(json_response(StatusCode::OK, serde_json::to_string(value)?))
}

fn service_error(err: ServiceError) -> Result<Response<Full<Bytes>>> {
    match err {
        ServiceError::Store(e) => Err(e),
        other => Ok(json_error_response(ApiErrorCode::from(&other), other.to_string())),
    }
}

/// Control API server
pub struct ControlApi {
    bind_addr: SocketAddr,
    service: Arc<ControlService>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlApi {
    pub fn new(
        bind_addr: SocketAddr,
        service: Arc<ControlService>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            service,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Control API listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let service = Arc::clone(&self.service);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, service).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    service: Arc<ControlService>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req| {
        let service = Arc::clone(&service);
        async move { handle_request(req, service).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, svc)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

/// Route a single request. Never fails; internal errors become a 500 JSON body.
pub async fn handle_request<B>(
    req: Request<B>,
    service: Arc<ControlService>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Control API request");

    let result = route(req, &method, &path, &service).await;

    Ok(result.unwrap_or_else(|e| {
        error!(%method, %path, error = %e, "Control API error");
        json_error_response(ApiErrorCode::InternalError, format!("Internal error: {e:#}"))
    }))
}

async fn route<B>(
    req: Request<B>,
    method: &Method,
    path: &str,
    service: &ControlService,
) -> Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    match (method, path) {
        (&Method::GET, "/health") => Ok(response(StatusCode::OK, "ok")),

        (&Method::GET, "/version") => json_ok(&serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
        })),

        // Records
        (&Method::GET, SERVERS_PATH) => match service.list_servers() {
            Ok(records) => json_ok(&records),
            Err(e) => service_error(e),
        },
        (&Method::POST, SERVERS_PATH) => {
            let records: Vec<ServerRecord> = match read_json(req).await {
                Ok(records) => records,
                Err(resp) => return Ok(resp),
            };
            match service.create_servers(records) {
                Ok(all) => json_ok(&all),
                Err(e) => service_error(e),
            }
        }
        (_, path) if path.starts_with("/api/proxy/servers/") => {
            let raw_id = path.strip_prefix("/api/proxy/servers/").unwrap_or("");
            let id: i64 = match raw_id.parse() {
                Ok(id) => id,
                Err(_) => {
                    return Ok(json_error_response(
                        ApiErrorCode::InvalidId,
                        format!("Invalid server id: {raw_id:?}"),
                    ))
                }
            };
            server_route(req, method, id, service).await
        }

        // Process control
        (&Method::POST, "/api/proxy/run") => json_ok(&service.start_servers().await),
        (&Method::POST, "/api/proxy/kill") => match service.stop_servers().await {
            Some(report) => json_ok(&report),
            None => Ok(response(StatusCode::NO_CONTENT, Bytes::new())),
        },
        (&Method::GET, "/api/proxy/running") => json_ok(&service.is_running()),
        (&Method::GET, "/api/proxy/status") => {
            let status = service.status();
            json_ok(&serde_json::json!({
                "state": status.state,
                "pid": status.process.as_ref().map(|p| p.pid),
                "startedAt": status.process.as_ref().map(|p| p.started_at),
                "lastStop": status.last_stop,
            }))
        }

        // Logs
        (&Method::GET, "/api/proxy/logs/access") => {
            let limit = match parse_limit(req.uri().query()) {
                Ok(limit) => limit,
                Err(resp) => return Ok(resp),
            };
            json_ok(&service.fetch_recent_log(limit).await?)
        }

        _ => Ok(json_error_response(
            ApiErrorCode::UnknownRoute,
            format!("No route for {method} {path}"),
        )),
    }
}

async fn server_route<B>(
    req: Request<B>,
    method: &Method,
    id: i64,
    service: &ControlService,
) -> Result<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let result = match *method {
        Method::GET => service.get_server(id).map(|record| json_ok(&record)),
        Method::POST | Method::PUT => {
            let record: ServerRecord = match read_json(req).await {
                Ok(record) => record,
                Err(resp) => return Ok(resp),
            };
            service.replace_server(id, record).map(|saved| json_ok(&saved))
        }
        Method::DELETE => service.delete_server(id).map(|remaining| json_ok(&remaining)),
        _ => {
            return Ok(json_error_response(
                ApiErrorCode::UnknownRoute,
                format!("No route for {method} {SERVERS_PATH}/{id}"),
            ))
        }
    };

    result.unwrap_or_else(service_error)
}

/// Read and deserialize a JSON body, or produce the 400 response to send back
async fn read_json<T, B>(req: Request<B>) -> std::result::Result<T, Response<Full<Bytes>>>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: std::fmt::Display,
{
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err(json_error_response(
                ApiErrorCode::InvalidJson,
                format!("Failed to read body: {e}"),
            ))
        }
    };

    serde_json::from_slice(&body)
        .map_err(|e| json_error_response(ApiErrorCode::InvalidJson, format!("Invalid JSON: {e}")))
}

fn parse_limit(query: Option<&str>) -> std::result::Result<usize, Response<Full<Bytes>>> {
    let raw = query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .find_map(|pair| pair.strip_prefix("limit="));

    match raw {
        None => Ok(DEFAULT_LOG_LIMIT),
        Some(value) => value.parse().map_err(|_| {
            json_error_response(ApiErrorCode::InvalidQuery, format!("Invalid limit: {value:?}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::store::SqliteStore;
    use crate::supervisor::ProxySupervisor;
    use std::path::Path;

    fn create_test_service(dir: &Path) -> Arc<ControlService> {
        let config = ProxyConfig {
            binary: dir.join("no-such-proxy"),
            working_dir: dir.to_path_buf(),
            config_path: dir.join("conf").join("nginx.tmp.conf"),
            access_log: dir.join("logs").join("json.log"),
            ..ProxyConfig::default()
        };
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        Arc::new(ControlService::new(store, ProxySupervisor::new(config)))
    }

    async fn send(
        service: &Arc<ControlService>,
        method: Method,
        uri: &str,
        body: &str,
    ) -> (StatusCode, Response<Full<Bytes>>, String) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap();
        let resp = handle_request(req, Arc::clone(service)).await.unwrap();
        let status = resp.status();
        let (parts, body) = resp.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        (status, Response::from_parts(parts, Full::new(Bytes::new())), text)
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let (status, _, body) = send(&service, Method::GET, "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, _, body) = send(&service, Method::GET, "/version", "").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["name"], PKG_NAME);
        assert_eq!(json["version"], VERSION);
    }

    #[tokio::test]
    async fn test_create_and_list_servers() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let payload = r#"[
            {"displayName": "api", "enable": true, "conf": "server { listen 8081; }"},
            {"displayName": "web", "enable": false, "conf": "server { listen 8082; }"}
        ]"#;
        let (status, _, body) = send(&service, Method::POST, "/api/proxy/servers", payload).await;
        assert_eq!(status, StatusCode::OK);
        let created: Vec<ServerRecord> = serde_json::from_str(&body).unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].id, Some(1));

        let (status, _, body) = send(&service, Method::GET, "/api/proxy/servers", "").await;
        assert_eq!(status, StatusCode::OK);
        let listed: Vec<ServerRecord> = serde_json::from_str(&body).unwrap();
        assert_eq!(listed, created);
    }

    #[tokio::test]
    async fn test_get_server_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let (status, resp, body) = send(&service, Method::GET, "/api/proxy/servers/42", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get("X-Control-Error").unwrap(), "NOT_FOUND");
        assert!(body.contains("server 42 not found"));
    }

    #[tokio::test]
    async fn test_invalid_id() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let (status, resp, _) = send(&service, Method::GET, "/api/proxy/servers/abc", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get("X-Control-Error").unwrap(), "INVALID_ID");
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let (status, resp, _) = send(&service, Method::POST, "/api/proxy/servers", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get("X-Control-Error").unwrap(), "INVALID_JSON");
    }

    #[tokio::test]
    async fn test_replace_server_id_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());
        service
            .create_servers(vec![
                ServerRecord::new("a", true, "server { listen 1; }"),
                ServerRecord::new("b", true, "server { listen 2; }"),
            ])
            .unwrap();

        let body = r#"{"id": 2, "displayName": "changed", "enable": true, "conf": ""}"#;
        let (status, resp, _) = send(&service, Method::PUT, "/api/proxy/servers/1", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get("X-Control-Error").unwrap(), "ID_MISMATCH");
        assert_eq!(service.get_server(1).unwrap().display_name, "a");
        assert_eq!(service.get_server(2).unwrap().display_name, "b");
    }

    #[tokio::test]
    async fn test_replace_server_with_loki_id() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());
        service.create_servers(vec![ServerRecord::new("a", true, "")]).unwrap();

        let body = r#"{"$loki": 1, "displayName": "renamed", "enable": false, "conf": ""}"#;
        let (status, _, body) = send(&service, Method::POST, "/api/proxy/servers/1", body).await;
        assert_eq!(status, StatusCode::OK);
        let saved: ServerRecord = serde_json::from_str(&body).unwrap();
        assert_eq!(saved.display_name, "renamed");
        assert!(!service.get_server(1).unwrap().enable);
    }

    #[tokio::test]
    async fn test_delete_server() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());
        service
            .create_servers(vec![ServerRecord::new("a", true, ""), ServerRecord::new("b", true, "")])
            .unwrap();

        let (status, _, body) = send(&service, Method::DELETE, "/api/proxy/servers/7", "").await;
        assert_eq!(status, StatusCode::OK);
        let remaining: Vec<ServerRecord> = serde_json::from_str(&body).unwrap();
        assert_eq!(remaining.len(), 2);

        let (_, _, body) = send(&service, Method::DELETE, "/api/proxy/servers/1", "").await;
        let remaining: Vec<ServerRecord> = serde_json::from_str(&body).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].display_name, "b");
    }

    #[tokio::test]
    async fn test_kill_when_idle_is_no_content() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let (status, _, body) = send(&service, Method::POST, "/api/proxy/kill", "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_run_failure_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let (status, _, body) = send(&service, Method::POST, "/api/proxy/run", "").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "error");
        assert!(json["message"].as_str().unwrap().starts_with("Error starting server"));
    }

    #[tokio::test]
    async fn test_running_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let (status, _, body) = send(&service, Method::GET, "/api/proxy/running", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "false");

        let (_, _, body) = send(&service, Method::GET, "/api/proxy/status", "").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["state"], "idle");
        assert!(json["pid"].is_null());
        assert!(json["lastStop"].is_null());
    }

    #[tokio::test]
    async fn test_access_log_limit() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let lines: Vec<String> = (1..=5)
            .map(|n| format!(r#"{{"request":"GET /{n} HTTP/1.1","status":"200"}}"#))
            .collect();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(service.access_log_path(), lines.join("\n")).unwrap();

        let (status, _, body) = send(&service, Method::GET, "/api/proxy/logs/access?limit=2", "").await;
        assert_eq!(status, StatusCode::OK);
        let entries: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["request"], "GET /5 HTTP/1.1");
        assert_eq!(entries[1]["request"], "GET /4 HTTP/1.1");

        let (_, _, body) = send(&service, Method::GET, "/api/proxy/logs/access", "").await;
        let entries: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(entries.len(), 5);

        let (status, resp, _) =
            send(&service, Method::GET, "/api/proxy/logs/access?limit=lots", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp.headers().get("X-Control-Error").unwrap(), "INVALID_QUERY");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let dir = tempfile::tempdir().unwrap();
        let service = create_test_service(dir.path());

        let (status, resp, _) = send(&service, Method::GET, "/api/proxy/nope", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get("X-Control-Error").unwrap(), "UNKNOWN_ROUTE");

        let (status, _, _) = send(&service, Method::PATCH, "/api/proxy/servers/1", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(None).unwrap(), DEFAULT_LOG_LIMIT);
        assert_eq!(parse_limit(Some("limit=5")).unwrap(), 5);
        assert_eq!(parse_limit(Some("foo=bar&limit=12")).unwrap(), 12);
        assert_eq!(parse_limit(Some("foo=bar")).unwrap(), DEFAULT_LOG_LIMIT);
        assert!(parse_limit(Some("limit=-1")).is_err());
    }
}
