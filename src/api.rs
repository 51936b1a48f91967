// src/api.rs
//
// Thin glue over the read-side snapshot functions: a JSON HTTP surface for
// the web UI and a websocket push feed. Nothing here touches the pipeline;
// every handler clones an owned snapshot and serializes it.
use crate::metrics;
use crate::snapshot::{ControlOp, SharedModel};
use crate::util::BarrierFlag;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tungstenite::Message;
use url::Url;

pub fn spawn_http(
    port: u16,
    shared: SharedModel,
    shutdown: Arc<BarrierFlag>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("api-http".into())
        .spawn(move || run_http(port, shared, shutdown))
        .expect("spawn api http")
}

fn run_http(port: u16, shared: SharedModel, shutdown: Arc<BarrierFlag>) {
    let addr = format!("127.0.0.1:{port}");
    let server = match tiny_http::Server::http(&addr) {
        Ok(s) => s,
        Err(e) => {
            log::error!("api: bind {addr} failed: {e}");
            return;
        }
    };
    log::info!("api listening on http://{addr}");
    loop {
        if shutdown.is_raised() {
            break;
        }
        let req = match server.recv_timeout(Duration::from_millis(250)) {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("api: recv failed: {e}");
                continue;
            }
        };
        let url = req.url().to_string();
        let (path, query) = parse_url(&url);
        let resp = match path.as_str() {
            "/api/data" => json_response(&serde_json::json!({
                "code": 0,
                "user": shared.snapshot_all(),
            })),
            "/api/skill" => match query_u64(&query, "uid").and_then(|u| shared.snapshot_skills(u))
            {
                Some(skills) => json_response(&serde_json::json!({
                    "code": 0,
                    "skills": skills,
                })),
                None => json_error(404, "unknown uid"),
            },
            "/api/enemies" => json_response(&serde_json::json!({
                "code": 0,
                "enemies": shared.snapshot_enemies(),
            })),
            "/api/errors" => json_response(&metrics::errors_snapshot()),
            "/api/clear" => {
                shared.control(ControlOp::Clear);
                json_ok()
            }
            "/api/pause" => {
                shared.control(ControlOp::Pause);
                json_ok()
            }
            "/api/resume" => {
                shared.control(ControlOp::Resume);
                json_ok()
            }
            "/api/setname" => {
                let uid = query_u64(&query, "uid");
                let name = query
                    .iter()
                    .find(|(k, _)| k == "name")
                    .map(|(_, v)| v.clone());
                match (uid, name) {
                    (Some(uid), Some(name)) if !name.is_empty() => {
                        shared.control(ControlOp::SetName { uid, name });
                        json_ok()
                    }
                    _ => json_error(400, "uid and name required"),
                }
            }
            _ => json_error(404, "not found"),
        };
        let _ = req.respond(resp);
    }
}

type JsonResponse = tiny_http::Response<std::io::Cursor<Vec<u8>>>;

fn json_response(v: &serde_json::Value) -> JsonResponse {
    let body = serde_json::to_vec(v).unwrap_or_else(|_| b"{}".to_vec());
    tiny_http::Response::from_data(body).with_status_code(200).with_header(
        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
    )
}

fn json_ok() -> JsonResponse {
    json_response(&serde_json::json!({"code": 0}))
}

fn json_error(status: u16, msg: &str) -> JsonResponse {
    let body = serde_json::to_vec(&serde_json::json!({"code": status, "msg": msg}))
        .unwrap_or_default();
    tiny_http::Response::from_data(body).with_status_code(status).with_header(
        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
    )
}

fn parse_url(uri: &str) -> (String, Vec<(String, String)>) {
    match Url::parse(&format!("http://localhost{uri}")) {
        Ok(u) => (
            u.path().to_string(),
            u.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect(),
        ),
        Err(_) => (uri.to_string(), Vec::new()),
    }
}

fn query_u64(query: &[(String, String)], key: &str) -> Option<u64> {
    query.iter().find(|(k, _)| k == key).and_then(|(_, v)| v.parse().ok())
}

/// Websocket push feed: every connected client receives the full actor
/// snapshot at the configured cadence.
pub fn spawn_ws(
    port: u16,
    interval_ms: u64,
    shared: SharedModel,
    shutdown: Arc<BarrierFlag>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("api-ws".into())
        .spawn(move || run_ws_listener(port, interval_ms, shared, shutdown))
        .expect("spawn api ws")
}

fn run_ws_listener(port: u16, interval_ms: u64, shared: SharedModel, shutdown: Arc<BarrierFlag>) {
    let addr = format!("127.0.0.1:{port}");
    let listener = match TcpListener::bind(&addr) {
        Ok(l) => l,
        Err(e) => {
            log::error!("ws: bind {addr} failed: {e}");
            return;
        }
    };
    listener.set_nonblocking(true).ok();
    log::info!("ws push feed listening on {addr}");
    loop {
        if shutdown.is_raised() {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let s = shared.clone();
                let sd = shutdown.clone();
                thread::spawn(move || {
                    if let Err(e) = handle_ws_client(stream, interval_ms, s, sd) {
                        log::debug!("ws client closed: {e:?}");
                    }
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                log::warn!("ws accept failed: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_ws_client(
    stream: TcpStream,
    interval_ms: u64,
    shared: SharedModel,
    shutdown: Arc<BarrierFlag>,
) -> anyhow::Result<()> {
    stream.set_nonblocking(false).ok();
    let mut ws = tungstenite::accept(stream)?;
    while !shutdown.is_raised() {
        let payload = serde_json::to_string(&serde_json::json!({
            "type": "data",
            "user": shared.snapshot_all(),
        }))?;
        ws.send(Message::Text(payload))?;
        thread::sleep(Duration::from_millis(interval_ms));
    }
    let _ = ws.close(None);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing() {
        let (path, q) = parse_url("/api/skill?uid=42&name=%E5%A4%9C%E9%9B%A8");
        assert_eq!(path, "/api/skill");
        assert_eq!(query_u64(&q, "uid"), Some(42));
        assert_eq!(
            q.iter().find(|(k, _)| k == "name").map(|(_, v)| v.as_str()),
            Some("夜雨")
        );
        assert_eq!(query_u64(&q, "missing"), None);
    }
}
