// src/capture.rs
use crate::metrics;
use crate::util::BarrierFlag;
use crossbeam_channel::Sender;
use log::{debug, info};
use std::sync::Arc;
use thiserror::Error;

/// One link-layer frame exactly as the device delivered it.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub ts_ms: u64,
    pub data: Vec<u8>,
}

/// Session-fatal capture failures. Per-frame problems never surface here;
/// anything returned from this module terminates the session.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture driver or device unavailable: {0}")]
    Unavailable(String),
    #[error("permission denied opening capture on {0}")]
    PermissionDenied(String),
    #[error("capture interface closed: {0}")]
    InterfaceClosed(String),
}

pub struct CaptureConfig {
    pub iface: String,
    pub port: u16,
}

fn classify_open_error(iface: &str, e: &pcap::Error) -> CaptureError {
    let msg = e.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("not permitted") {
        CaptureError::PermissionDenied(iface.to_string())
    } else {
        CaptureError::Unavailable(msg)
    }
}

/// Blocking capture loop. Opens the device promiscuous with a BPF filter for
/// the game port and forwards frames until `shutdown` is raised or the device
/// fails. Queue overflow drops the frame and counts it; the pipeline prefers
/// losing a frame over blocking the capture read.
pub fn capture_loop(
    cfg: &CaptureConfig,
    q_out: Sender<RawFrame>,
    shutdown: Arc<BarrierFlag>,
) -> Result<(), CaptureError> {
    let iface = if cfg.iface.is_empty() {
        pcap::Device::lookup()
            .ok()
            .flatten()
            .map(|d| d.name)
            .ok_or_else(|| CaptureError::Unavailable("no default capture device".into()))?
    } else {
        cfg.iface.clone()
    };

    let inactive = pcap::Capture::from_device(iface.as_str())
        .map_err(|e| classify_open_error(&iface, &e))?;
    let mut cap = inactive
        .promisc(true)
        .snaplen(65_535)
        // Short read timeout so the shutdown flag is polled regularly.
        .timeout(100)
        .immediate_mode(true)
        .open()
        .map_err(|e| classify_open_error(&iface, &e))?;

    let filter = format!("tcp port {}", cfg.port);
    cap.filter(&filter, true)
        .map_err(|e| CaptureError::Unavailable(format!("bpf filter {filter:?}: {e}")))?;

    info!("capture started on {} ({})", iface, filter);

    let mut dropped: u64 = 0;
    loop {
        if shutdown.is_raised() {
            break;
        }
        match cap.next_packet() {
            Ok(pkt) => {
                let ts_ms = pkt.header.ts.tv_sec as u64 * 1000
                    + pkt.header.ts.tv_usec as u64 / 1000;
                let frame = RawFrame { ts_ms, data: pkt.data.to_vec() };
                let n = frame.data.len();
                if q_out.try_send(frame).is_err() {
                    dropped += 1;
                    metrics::inc_capture_drop();
                    if dropped % 10_000 == 1 {
                        debug!("capture: frame queue full, dropped={dropped}");
                    }
                } else {
                    metrics::inc_capture(n);
                }
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => {
                return Err(CaptureError::InterfaceClosed(iface));
            }
            Err(e) => {
                return Err(CaptureError::InterfaceClosed(format!("{iface}: {e}")));
            }
        }
    }

    info!("capture stopped on {iface}");
    Ok(())
}
