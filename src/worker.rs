// src/worker.rs
//
// The single packet-processing worker. It owns reassembly, framing and
// decode, and applies each frame's events to the shared model under one
// short write lock. Anything that can block (metadata fetch, disk) happens
// on other threads; this loop only parses bytes and takes the lock.
use crate::capture::RawFrame;
use crate::decoder::{self, Event};
use crate::fetcher::FetcherClient;
use crate::fightlog::FightLog;
use crate::framing::Record;
use crate::metrics;
use crate::reassembly::FlowTable;
use crate::reference::{self, Locale};
use crate::snapshot::SharedModel;
use crate::util::{now_ms, BarrierFlag};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

const HOUSEKEEP_EVERY_MS: u64 = 1000;

pub struct WorkerConfig {
    pub game_port: u16,
    pub signature: Vec<u8>,
    pub reorder_cap_bytes: usize,
    pub flow_idle_ms: u64,
}

pub struct Worker {
    flows: FlowTable,
    shared: SharedModel,
    fetcher: Option<FetcherClient>,
    fightlog: Option<FightLog>,
    records: Vec<Record>,
    events: Vec<Event>,
    last_housekeep_ms: u64,
}

impl Worker {
    pub fn new(
        cfg: &WorkerConfig,
        shared: SharedModel,
        fetcher: Option<FetcherClient>,
        fightlog: Option<FightLog>,
    ) -> Self {
        Self {
            flows: FlowTable::new(
                cfg.game_port,
                cfg.signature.clone(),
                cfg.reorder_cap_bytes,
                cfg.flow_idle_ms,
            ),
            shared,
            fetcher,
            fightlog,
            records: Vec::with_capacity(64),
            events: Vec::with_capacity(64),
            last_housekeep_ms: 0,
        }
    }

    /// Run one frame through reassembly, framing, decode and dispatch.
    pub fn handle_frame(&mut self, ts_ms: u64, data: &[u8]) {
        self.records.clear();
        self.events.clear();
        self.flows.handle_frame(ts_ms, data, &mut self.records);
        if self.records.is_empty() {
            return;
        }
        for rec in &self.records {
            decoder::decode_into(rec, &mut self.events);
        }
        if self.events.is_empty() {
            return;
        }
        let newly_seen = self.shared.apply_batch(&self.events, ts_ms);
        if let Some(f) = &self.fetcher {
            if !newly_seen.is_empty() {
                let generation = self.shared.generation();
                for uid in newly_seen {
                    f.request(uid, generation);
                }
            }
        }
        if let Some(log) = &self.fightlog {
            for ev in &self.events {
                if let Some(line) = format_event(ts_ms, ev) {
                    log.line(line);
                }
            }
        }
    }

    /// Idle-flow eviction, idle-clear check, gauge refresh. Cheap; called
    /// about once a second.
    pub fn housekeep(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_housekeep_ms) < HOUSEKEEP_EVERY_MS {
            return;
        }
        self.last_housekeep_ms = now_ms;
        self.flows.evict_idle(now_ms);
        metrics::set_flows_active(self.flows.active_flows());
        if self.shared.maybe_idle_clear(now_ms) {
            if let Some(log) = &self.fightlog {
                log.rotate(self.shared.session_start_ms());
            }
        }
    }
}

fn format_event(ts_ms: u64, ev: &Event) -> Option<String> {
    let ts = chrono::DateTime::from_timestamp_millis(ts_ms as i64)
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_default();
    match *ev {
        Event::Damage { uid, target, skill, value, flags, .. } => {
            let name = reference::skill_name(skill, Locale::Zh).unwrap_or("未知技能");
            let tag = match (flags.crit, flags.lucky || flags.cause_lucky) {
                (true, true) => " (幸运暴击)",
                (true, false) => " (暴击)",
                (false, true) => " (幸运)",
                (false, false) => "",
            };
            Some(format!("{ts} {uid} {name}[{skill}] -> {target} 伤害 {value}{tag}"))
        }
        Event::Healing { uid, target, skill, value, .. } => {
            let name = reference::skill_name(skill, Locale::Zh).unwrap_or("未知技能");
            Some(format!("{ts} {uid} {name}[{skill}] -> {target} 治疗 +{value}"))
        }
        Event::TakeDamage { uid, value, lethal } => {
            let tag = if lethal { " (倒地)" } else { "" };
            Some(format!("{ts} {uid} 承受 {value}{tag}"))
        }
        _ => None,
    }
}

/// Channel-driven entry point used by main. Exits when the capture side
/// disconnects or the shutdown flag is raised.
pub fn worker_loop(
    q_in: Receiver<RawFrame>,
    shared: SharedModel,
    fetcher: Option<FetcherClient>,
    fightlog: Option<FightLog>,
    cfg: WorkerConfig,
    shutdown: Arc<BarrierFlag>,
) -> anyhow::Result<()> {
    let mut w = Worker::new(&cfg, shared, fetcher, fightlog);
    loop {
        if shutdown.is_raised() {
            break;
        }
        match q_in.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => {
                w.handle_frame(frame.ts_ms, &frame.data);
                w.housekeep(now_ms());
            }
            Err(RecvTimeoutError::Timeout) => {
                w.housekeep(now_ms());
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}
