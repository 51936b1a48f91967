// src/main.rs
mod api;
mod capture;
mod config;
mod decoder;
mod fetcher;
mod fightlog;
mod framing;
mod metrics;
mod model;
mod reassembly;
mod reference;
mod snapshot;
mod stats;
mod util;
mod worker;

use crate::capture::{CaptureConfig, RawFrame};
use crate::config::AppConfig;
use crate::model::EngineSettings;
use crate::snapshot::{ControlOp, SharedModel};
use crate::util::{now_ms, BarrierFlag};
use crate::worker::{worker_loop, WorkerConfig};
use crossbeam_channel::bounded;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

fn main() -> anyhow::Result<()> {
    let cfg_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Load config before logger to allow JSON formatting choice
    let cfg = AppConfig::from_file(&cfg_path)?;

    if cfg.general.json_logs {
        let mut b =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        b.format(|buf, record| {
            use std::io::Write;
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            writeln!(
                buf,
                "{{\"ts\":\"{}\",\"level\":\"{}\",\"target\":\"{}\",\"msg\":\"{}\"}}",
                ts,
                record.level(),
                record.target(),
                record.args().to_string().replace('"', "'")
            )
        })
        .init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("loaded config: {cfg:?}");

    let shutdown = Arc::new(BarrierFlag::default());
    {
        let s = shutdown.clone();
        ctrlc::set_handler(move || {
            s.raise();
        })?;
    }

    let metrics_handle = cfg.metrics.as_ref().map(|m| metrics::spawn_http(m.bind.clone()));

    let shared = SharedModel::new(EngineSettings {
        auto_clear_on_timeout: cfg.engine.auto_clear_on_timeout,
        idle_clear_ms: cfg.engine.idle_clear_ms,
        clear_on_scene_change: cfg.engine.clear_on_scene_change,
    });

    // Fight log writer (optional)
    let (fight_log, fightlog_handle) = if cfg.fightlog.enable {
        let (log, handle) =
            fightlog::spawn(PathBuf::from(&cfg.fightlog.dir), shared.session_start_ms());
        (Some(log), Some(handle))
    } else {
        (None, None)
    };

    // Metadata fetcher (optional)
    let (fetcher_client, fetcher_handle) = if let Some(ref f) = cfg.fetch {
        let (cli, handle) = fetcher::spawn(
            f.url.clone(),
            f.timeout_ms,
            f.queue_capacity,
            shared.clone(),
            shutdown.clone(),
        );
        (Some(cli), Some(handle))
    } else {
        (None, None)
    };

    // Capture -> worker frame channel
    let (frame_tx, frame_rx) = bounded::<RawFrame>(cfg.capture.frame_queue_capacity);

    let t_capture = {
        let cap_cfg = CaptureConfig { iface: cfg.capture.iface.clone(), port: cfg.capture.port };
        let cap_shutdown = shutdown.clone();
        thread::Builder::new().name("capture".into()).spawn(move || {
            if let Err(e) = capture::capture_loop(&cap_cfg, frame_tx, cap_shutdown.clone()) {
                // Capture failures are session-fatal: stop everything.
                error!("capture failed: {e}");
                metrics::inc_fatal_session();
                cap_shutdown.raise();
            }
        })?
    };

    // Packet worker behind a supervisor: a panic clears combat data and
    // restarts the worker; a clean error ends the session.
    let t_worker = {
        let signature = cfg.signature_bytes();
        let game_port = cfg.capture.port;
        let reorder_cap = cfg.engine.reorder_cap_bytes;
        let flow_idle_ms = cfg.engine.flow_idle_ms;
        let shared = shared.clone();
        let shutdown = shutdown.clone();
        let fight_log = fight_log.clone();
        let fetcher_client = fetcher_client.clone();
        thread::Builder::new().name("worker-supervisor".into()).spawn(move || loop {
            let wcfg = WorkerConfig {
                game_port,
                signature: signature.clone(),
                reorder_cap_bytes: reorder_cap,
                flow_idle_ms,
            };
            let q = frame_rx.clone();
            let sh = shared.clone();
            let sd = shutdown.clone();
            let fl = fight_log.clone();
            let fc = fetcher_client.clone();
            let h = thread::Builder::new()
                .name("worker".into())
                .spawn(move || worker_loop(q, sh, fc, fl, wcfg, sd))
                .expect("spawn worker");
            match h.join() {
                Ok(Ok(())) => break,
                Ok(Err(e)) => {
                    error!("worker failed: {e:?}");
                    metrics::inc_fatal_session();
                    shutdown.raise();
                    break;
                }
                Err(_) => {
                    error!("worker panicked; clearing combat data and restarting");
                    metrics::inc_fatal_session();
                    metrics::inc_worker_restart();
                    shared.control(ControlOp::Clear);
                    if shutdown.is_raised() {
                        break;
                    }
                }
            }
        })?
    };

    // Read-side glue
    let t_api = api::spawn_http(cfg.api.local_port, shared.clone(), shutdown.clone());
    let t_ws = api::spawn_ws(
        cfg.api.ws_port(),
        cfg.api.push_interval_ms,
        shared.clone(),
        shutdown.clone(),
    );

    // Join (log panics explicitly to aid diagnosis in production)
    if t_capture.join().is_err() {
        error!("capture thread panicked");
    }
    if t_worker.join().is_err() {
        error!("worker supervisor panicked");
    }
    shutdown.raise();

    // Final fight-log snapshot for this session
    if let Some(log) = fight_log {
        log.finish(serde_json::json!({
            "sessionStartMs": shared.session_start_ms(),
            "endedMs": now_ms(),
            "players": shared.snapshot_all(),
            "enemies": shared.snapshot_enemies(),
        }));
    }
    if let Some(h) = fightlog_handle {
        h.join();
    }
    if let Some(h) = fetcher_handle {
        h.join();
    }
    if t_api.join().is_err() {
        error!("api thread panicked");
    }
    if t_ws.join().is_err() {
        error!("ws thread panicked");
    }
    // Gracefully stop metrics HTTP (poke /shutdown and join)
    if let Some(m) = &cfg.metrics {
        request_http_shutdown(&m.bind);
    }
    if let Some(h) = metrics_handle {
        let _ = h.join();
    }
    info!("clean shutdown");
    Ok(())
}

fn request_http_shutdown(addr: &str) {
    use std::io::Write;
    if let Ok(mut s) = std::net::TcpStream::connect(addr) {
        let _ =
            s.write_all(b"GET /shutdown HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        let _ = s.flush();
    }
}
