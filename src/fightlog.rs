// src/fightlog.rs
//
// Optional human-readable fight log. A writer thread owns the file handles;
// the worker only formats lines and sends them over a bounded channel, so a
// slow disk can never stall packet processing. Each session gets its own
// logs/<session_start_ms>/ directory with fight.log and, at the end, a
// summary.json snapshot.
use crossbeam_channel::{Receiver, Sender};
use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::thread;

#[derive(Debug)]
pub enum LogMsg {
    Line(String),
    /// A clear happened; start a new session directory.
    Rotate(u64),
    /// Session over: write the final snapshot and stop.
    Finish(serde_json::Value),
}

#[derive(Clone)]
pub struct FightLog {
    tx: Sender<LogMsg>,
}

impl FightLog {
    pub fn line(&self, s: String) {
        let _ = self.tx.try_send(LogMsg::Line(s));
    }

    pub fn rotate(&self, session_start_ms: u64) {
        let _ = self.tx.try_send(LogMsg::Rotate(session_start_ms));
    }

    pub fn finish(&self, summary: serde_json::Value) {
        let _ = self.tx.send(LogMsg::Finish(summary));
    }
}

pub struct FightLogHandle {
    join: thread::JoinHandle<()>,
}

impl FightLogHandle {
    pub fn join(self) {
        let _ = self.join.join();
    }
}

pub fn spawn(dir: PathBuf, session_start_ms: u64) -> (FightLog, FightLogHandle) {
    let (tx, rx) = crossbeam_channel::bounded::<LogMsg>(4096);
    let join = thread::Builder::new()
        .name("fightlog".into())
        .spawn(move || run_writer(dir, session_start_ms, rx))
        .expect("spawn fightlog writer");
    (FightLog { tx }, FightLogHandle { join })
}

struct SessionFile {
    dir: PathBuf,
    file: Option<File>,
}

impl SessionFile {
    fn open(root: &Path, session_start_ms: u64) -> Self {
        let dir = root.join(session_start_ms.to_string());
        let file = fs::create_dir_all(&dir)
            .ok()
            .and_then(|_| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join("fight.log"))
                    .ok()
            });
        if file.is_none() {
            log::error!("fightlog: cannot open {:?}", dir.join("fight.log"));
        }
        Self { dir, file }
    }

    fn write_line(&mut self, line: &str) {
        if let Some(f) = self.file.as_mut() {
            let _ = writeln!(f, "{line}");
        }
    }

    fn write_summary(&self, summary: &serde_json::Value) {
        match serde_json::to_vec_pretty(summary) {
            Ok(body) => {
                if let Err(e) = fs::write(self.dir.join("summary.json"), body) {
                    log::error!("fightlog: summary write failed: {e:?}");
                }
            }
            Err(e) => log::error!("fightlog: summary serialize failed: {e:?}"),
        }
    }
}

fn run_writer(root: PathBuf, session_start_ms: u64, rx: Receiver<LogMsg>) {
    let mut session = SessionFile::open(&root, session_start_ms);
    log::info!("fight log started -> {:?}", session.dir);
    while let Ok(msg) = rx.recv() {
        match msg {
            LogMsg::Line(line) => session.write_line(&line),
            LogMsg::Rotate(start_ms) => {
                if let Some(f) = session.file.as_mut() {
                    let _ = f.flush();
                }
                session = SessionFile::open(&root, start_ms);
                log::info!("fight log rotated -> {:?}", session.dir);
            }
            LogMsg::Finish(summary) => {
                session.write_summary(&summary);
                break;
            }
        }
    }
    if let Some(f) = session.file.as_mut() {
        let _ = f.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_lines_and_summary() {
        let root = std::env::temp_dir().join(format!("fightlog-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let (log, handle) = spawn(root.clone(), 1000);
        log.line("12:00:00 夜雨 聚能射线 -> 邪恶的史莱姆 1000 (暴击)".into());
        log.line("12:00:01 夜雨 生命绽放 +500".into());
        log.finish(serde_json::json!({"players": 1}));
        handle.join();

        let dir = root.join("1000");
        let text = fs::read_to_string(dir.join("fight.log")).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("聚能射线"));
        let summary = fs::read_to_string(dir.join("summary.json")).unwrap();
        assert!(summary.contains("players"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn rotate_switches_directory() {
        let root = std::env::temp_dir().join(format!("fightlog-rot-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let (log, handle) = spawn(root.clone(), 1000);
        log.line("first".into());
        log.rotate(2000);
        log.line("second".into());
        log.finish(serde_json::json!({}));
        handle.join();

        let first = fs::read_to_string(root.join("1000").join("fight.log")).unwrap();
        let second = fs::read_to_string(root.join("2000").join("fight.log")).unwrap();
        assert!(first.contains("first"));
        assert!(second.contains("second"));
        // The summary lands in the live (rotated-to) session directory.
        assert!(root.join("2000").join("summary.json").exists());
        let _ = fs::remove_dir_all(&root);
    }
}
