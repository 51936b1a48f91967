// src/fetcher.rs
//
// Background player-metadata lookups. The packet worker never blocks on the
// network: it enqueues a uid here and moves on. One thread drains the queue
// serially, so there is never more than one in-flight request per uid; the
// queue itself deduplicates and sheds its oldest entry on overflow.
use crate::metrics;
use crate::model::RemoteInfo;
use crate::snapshot::SharedModel;
use crate::util::{now_ms, BarrierFlag};
use hashbrown::{HashMap, HashSet};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Failed uids are not retried for this long.
const NEGATIVE_CACHE_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy)]
struct FetchRequest {
    uid: u64,
    generation: u64,
}

struct QueueInner {
    deque: VecDeque<FetchRequest>,
    queued: HashSet<u64>,
    /// uid -> earliest retry time. Shared negative cache for failed fetches
    /// and overflow-shed requests alike.
    retry_not_before: HashMap<u64, u64>,
    cap: usize,
}

/// Bounded FIFO with uid dedup; overflow drops the oldest pending request
/// and negative-caches it so it is not retried immediately.
struct FetchQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl FetchQueue {
    fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                deque: VecDeque::with_capacity(cap),
                queued: HashSet::new(),
                retry_not_before: HashMap::new(),
                cap,
            }),
            cv: Condvar::new(),
        }
    }

    fn push(&self, req: FetchRequest) {
        let now = now_ms();
        let mut g = self.inner.lock().unwrap();
        if g.retry_not_before.get(&req.uid).is_some_and(|&t| now < t) {
            return;
        }
        if !g.queued.insert(req.uid) {
            return;
        }
        if g.deque.len() >= g.cap {
            if let Some(old) = g.deque.pop_front() {
                g.queued.remove(&old.uid);
                g.retry_not_before.insert(old.uid, now + NEGATIVE_CACHE_MS);
                metrics::inc_fetch_dropped();
            }
        }
        g.deque.push_back(req);
        drop(g);
        self.cv.notify_one();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<FetchRequest> {
        let mut g = self.inner.lock().unwrap();
        if g.deque.is_empty() {
            let (guard, _) = self.cv.wait_timeout(g, timeout).unwrap();
            g = guard;
        }
        let req = g.deque.pop_front()?;
        g.queued.remove(&req.uid);
        Some(req)
    }

    /// Suppress retries for `uid` until `until_ms`.
    fn ban_until(&self, uid: u64, until_ms: u64) {
        let mut g = self.inner.lock().unwrap();
        g.retry_not_before.insert(uid, until_ms);
        // Opportunistic cleanup so the cache does not grow unbounded.
        if g.retry_not_before.len() > 4096 {
            let now = now_ms();
            g.retry_not_before.retain(|_, &mut t| now < t);
        }
    }
}

#[derive(Clone)]
pub struct FetcherClient {
    queue: Arc<FetchQueue>,
}

impl FetcherClient {
    pub fn request(&self, uid: u64, generation: u64) {
        self.queue.push(FetchRequest { uid, generation });
    }
}

pub struct FetcherHandle {
    join: thread::JoinHandle<()>,
}

impl FetcherHandle {
    pub fn join(self) {
        let _ = self.join.join();
    }
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    success: bool,
    data: Option<FetchData>,
}

#[derive(Debug, Deserialize)]
struct FetchData {
    #[serde(default)]
    players: Vec<PlayerEntry>,
}

#[derive(Debug, Deserialize)]
struct PlayerEntry {
    player_id: u64,
    name: Option<String>,
    profession: Option<u32>,
    #[serde(rename = "fightPoint")]
    fight_point: Option<u64>,
    max_hp: Option<i64>,
}

pub fn spawn(
    url: String,
    timeout_ms: u64,
    queue_capacity: usize,
    shared: SharedModel,
    shutdown: Arc<BarrierFlag>,
) -> (FetcherClient, FetcherHandle) {
    let queue = Arc::new(FetchQueue::new(queue_capacity));
    let q = queue.clone();
    let join = thread::Builder::new()
        .name("fetcher".into())
        .spawn(move || run(url, timeout_ms, q, shared, shutdown))
        .expect("spawn fetcher");
    (FetcherClient { queue }, FetcherHandle { join })
}

fn run(
    url: String,
    timeout_ms: u64,
    queue: Arc<FetchQueue>,
    shared: SharedModel,
    shutdown: Arc<BarrierFlag>,
) {
    log::info!("metadata fetcher running against {url}");
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            log::error!("fetcher: http client init failed: {e:?}");
            return;
        }
    };

    while !shutdown.is_raised() {
        let req = match queue.pop_timeout(Duration::from_millis(250)) {
            Some(r) => r,
            None => continue,
        };

        match fetch_one(&client, &url, req.uid) {
            Ok(Some(info)) => {
                metrics::inc_fetch_ok();
                if !shared.apply_remote(req.uid, req.generation, &info) {
                    log::debug!("fetcher: stale result for uid {} dropped", req.uid);
                }
            }
            Ok(None) => {
                // Endpoint answered but had nothing for this uid.
                metrics::inc_fetch_fail();
                queue.ban_until(req.uid, now_ms() + NEGATIVE_CACHE_MS);
            }
            Err(e) => {
                log::debug!("fetcher: uid {} failed: {e:?}", req.uid);
                metrics::inc_fetch_fail();
                queue.ban_until(req.uid, now_ms() + NEGATIVE_CACHE_MS);
            }
        }
    }
}

fn fetch_one(
    client: &reqwest::blocking::Client,
    url: &str,
    uid: u64,
) -> anyhow::Result<Option<RemoteInfo>> {
    let resp: FetchResponse = client
        .get(url)
        .query(&[("player_id", uid.to_string())])
        .send()?
        .error_for_status()?
        .json()?;
    if !resp.success {
        return Ok(None);
    }
    let players = match resp.data {
        Some(d) => d.players,
        None => return Ok(None),
    };
    // Only an exact uid match is trusted; the endpoint may return a page of
    // loosely related entries.
    let entry = players.into_iter().find(|p| p.player_id == uid);
    Ok(entry.map(|p| RemoteInfo {
        name: p.name,
        profession: p.profession,
        fight_point: p.fight_point,
        max_hp: p.max_hp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_dedups_and_sheds_oldest() {
        let q = FetchQueue::new(2);
        q.push(FetchRequest { uid: 1, generation: 0 });
        q.push(FetchRequest { uid: 1, generation: 0 }); // dup, ignored
        q.push(FetchRequest { uid: 2, generation: 0 });
        q.push(FetchRequest { uid: 3, generation: 0 }); // sheds uid 1
        let a = q.pop_timeout(Duration::from_millis(1)).unwrap();
        let b = q.pop_timeout(Duration::from_millis(1)).unwrap();
        assert_eq!((a.uid, b.uid), (2, 3));
        assert!(q.pop_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn shed_uid_is_negative_cached() {
        let q = FetchQueue::new(1);
        q.push(FetchRequest { uid: 1, generation: 0 });
        q.push(FetchRequest { uid: 2, generation: 0 });
        // uid 1 was shed on overflow; re-pushing it inside the cache window
        // is a no-op.
        q.push(FetchRequest { uid: 1, generation: 0 });
        assert_eq!(q.pop_timeout(Duration::from_millis(1)).unwrap().uid, 2);
        assert!(q.pop_timeout(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn ban_expires() {
        let q = FetchQueue::new(4);
        q.push(FetchRequest { uid: 5, generation: 0 });
        assert_eq!(q.pop_timeout(Duration::from_millis(1)).unwrap().uid, 5);
        q.ban_until(5, now_ms() + 10_000);
        q.push(FetchRequest { uid: 5, generation: 0 });
        assert!(q.pop_timeout(Duration::from_millis(1)).is_none());
        // An expired ban no longer blocks.
        q.ban_until(5, 0);
        q.push(FetchRequest { uid: 5, generation: 0 });
        assert_eq!(q.pop_timeout(Duration::from_millis(1)).unwrap().uid, 5);
    }

    #[test]
    fn response_parsing_exact_match_only() {
        let body = r#"{
            "success": true,
            "data": { "players": [
                {"player_id": 41, "name": "误导", "fightPoint": 1},
                {"player_id": 42, "name": "夜雨", "profession": 8,
                 "fightPoint": 21000, "max_hp": 55000}
            ]}
        }"#;
        let resp: FetchResponse = serde_json::from_str(body).unwrap();
        assert!(resp.success);
        let players = resp.data.unwrap().players;
        let hit = players.into_iter().find(|p| p.player_id == 42).unwrap();
        assert_eq!(hit.name.as_deref(), Some("夜雨"));
        assert_eq!(hit.fight_point, Some(21_000));
    }
}
