// src/snapshot.rs
//
// Owned, serializable views of the combat model plus the lock protocol that
// hands them to readers. Writers (the packet worker) and readers share one
// RwLock; both hold it only long enough to mutate or clone, never across
// I/O. Snapshots are copies, so a reader can never observe a half-applied
// batch.
use crate::decoder::Event;
use crate::model::{CombatModel, EngineSettings, RemoteInfo};
use crate::reference::{self, Locale};
use crate::stats::{StatisticBlock, HEAL_KEY_OFFSET};
use crate::util::now_ms;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub normal: u64,
    pub critical: u64,
    pub lucky: u64,
    pub crit_lucky: u64,
    pub total: u64,
    pub hp_lessen: u64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CountSummary {
    pub normal: u64,
    pub critical: u64,
    pub lucky: u64,
    pub crit_lucky: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorSummary {
    pub uid: u64,
    pub name: String,
    pub profession: String,
    pub sub_profession: String,
    pub role: Option<reference::Role>,
    pub fight_point: u64,
    pub hp: i64,
    pub max_hp: i64,
    pub dead_count: u32,
    pub taken_damage: u64,
    pub is_local: bool,
    pub total_damage: BlockSummary,
    pub total_count: CountSummary,
    pub total_healing: BlockSummary,
    pub healing_count: CountSummary,
    pub realtime_dps: u64,
    pub realtime_dps_max: u64,
    pub total_dps: f64,
    pub realtime_hps: u64,
    pub realtime_hps_max: u64,
    pub total_hps: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillSummary {
    pub skill_id: u64,
    pub name: String,
    pub element: u8,
    pub is_heal: bool,
    pub value: BlockSummary,
    pub count: CountSummary,
    pub realtime_per_sec: u64,
    pub realtime_per_sec_max: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnemySummary {
    pub id: u64,
    pub name: Option<String>,
    pub hp: Option<i64>,
    pub max_hp: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum ControlOp {
    Clear,
    Pause,
    Resume,
    SetName { uid: u64, name: String },
}

fn block_summary(b: &StatisticBlock) -> (BlockSummary, CountSummary) {
    (
        BlockSummary {
            normal: b.normal,
            critical: b.critical,
            lucky: b.lucky,
            crit_lucky: b.crit_lucky,
            total: b.total,
            hp_lessen: b.hp_lessen,
        },
        CountSummary {
            normal: b.count_normal,
            critical: b.count_critical,
            lucky: b.count_lucky,
            crit_lucky: b.count_crit_lucky,
            total: b.count_total,
        },
    )
}

/// Shared handle to the combat model. Clones are cheap; all of them point at
/// the same state.
#[derive(Clone)]
pub struct SharedModel {
    inner: Arc<RwLock<CombatModel>>,
}

impl SharedModel {
    pub fn new(settings: EngineSettings) -> Self {
        Self { inner: Arc::new(RwLock::new(CombatModel::new(settings, now_ms()))) }
    }

    /// Apply one decoded batch under a single short write lock. Returns the
    /// uids first seen in this batch.
    pub fn apply_batch(&self, events: &[Event], now_ms: u64) -> Vec<u64> {
        let mut newly_seen = Vec::new();
        let mut m = self.inner.write();
        for ev in events {
            m.apply(ev, now_ms, &mut newly_seen);
        }
        newly_seen
    }

    pub fn apply_remote(&self, uid: u64, generation: u64, info: &RemoteInfo) -> bool {
        self.inner.write().apply_remote(uid, generation, info)
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn session_start_ms(&self) -> u64 {
        self.inner.read().session_start_ms
    }

    pub fn maybe_idle_clear(&self, now_ms: u64) -> bool {
        self.inner.write().maybe_idle_clear(now_ms)
    }

    pub fn control(&self, op: ControlOp) {
        let mut m = self.inner.write();
        match op {
            ControlOp::Clear => m.clear(now_ms()),
            ControlOp::Pause => {
                m.paused = true;
                log::info!("dispatch paused");
            }
            ControlOp::Resume => {
                m.paused = false;
                log::info!("dispatch resumed");
            }
            ControlOp::SetName { uid, name } => m.set_name(uid, &name),
        }
    }

    /// Per-actor summaries. Takes the write lock because reading refreshes
    /// the sliding windows and rate peaks.
    pub fn snapshot_all(&self) -> Vec<ActorSummary> {
        self.snapshot_all_at(now_ms())
    }

    pub fn snapshot_all_at(&self, now_ms: u64) -> Vec<ActorSummary> {
        let mut m = self.inner.write();
        let local = m.local_uid;
        let mut out = Vec::with_capacity(m.actors.len());
        for a in m.actors.values_mut() {
            // Actors that never produced combat data stay internal until a
            // display name is learned.
            if !a.has_display_name()
                && a.damage.is_empty()
                && a.healing.is_empty()
                && a.taken_damage == 0
            {
                continue;
            }
            let realtime_dps = a.damage.realtime_per_sec(now_ms);
            let realtime_hps = a.healing.realtime_per_sec(now_ms);
            let (total_damage, total_count) = block_summary(&a.damage);
            let (total_healing, healing_count) = block_summary(&a.healing);
            out.push(ActorSummary {
                uid: a.uid,
                name: a.name.clone(),
                profession: a
                    .profession
                    .and_then(|id| reference::profession_name(id, Locale::Zh))
                    .unwrap_or("")
                    .to_string(),
                sub_profession: a.sub_profession.clone(),
                role: a.profession.and_then(|id| reference::profession_by_id(id)).map(|p| p.role),
                fight_point: a.fight_point,
                hp: a.hp,
                max_hp: a.max_hp,
                dead_count: a.dead_count,
                taken_damage: a.taken_damage,
                is_local: Some(a.uid) == local,
                total_damage,
                total_count,
                total_healing,
                healing_count,
                realtime_dps,
                realtime_dps_max: a.damage.peak_per_sec(),
                total_dps: a.damage.session_per_sec(),
                realtime_hps,
                realtime_hps_max: a.healing.peak_per_sec(),
                total_hps: a.healing.session_per_sec(),
            });
        }
        // Local actor first, then by damage dealt.
        out.sort_by(|x, y| {
            y.is_local
                .cmp(&x.is_local)
                .then(y.total_damage.total.cmp(&x.total_damage.total))
        });
        out
    }

    /// Per-skill breakdown for one actor; None when the uid is unknown.
    pub fn snapshot_skills(&self, uid: u64) -> Option<Vec<SkillSummary>> {
        self.snapshot_skills_at(uid, now_ms())
    }

    pub fn snapshot_skills_at(&self, uid: u64, now_ms: u64) -> Option<Vec<SkillSummary>> {
        let mut m = self.inner.write();
        let a = m.actors.get_mut(&uid)?;
        let mut out = Vec::with_capacity(a.skills.len());
        for (&key, s) in a.skills.iter_mut() {
            let is_heal = key >= HEAL_KEY_OFFSET;
            let raw_id = if is_heal { key - HEAL_KEY_OFFSET } else { key } as u32;
            let realtime = s.block.realtime_per_sec(now_ms);
            let (value, count) = block_summary(&s.block);
            out.push(SkillSummary {
                skill_id: key,
                name: reference::skill_name(raw_id, Locale::Zh)
                    .unwrap_or("")
                    .to_string(),
                element: s.element,
                is_heal,
                value,
                count,
                realtime_per_sec: realtime,
                realtime_per_sec_max: s.block.peak_per_sec(),
            });
        }
        out.sort_by(|x, y| y.value.total.cmp(&x.value.total));
        Some(out)
    }

    pub fn snapshot_enemies(&self) -> Vec<EnemySummary> {
        let m = self.inner.read();
        let mut out: Vec<EnemySummary> = m
            .enemies
            .iter()
            .map(|(&id, e)| EnemySummary {
                id,
                name: e.name.clone().or_else(|| {
                    reference::monster_name(id, Locale::Zh).map(|s| s.to_string())
                }),
                hp: e.hp,
                max_hp: e.max_hp,
            })
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::HitFlags;

    fn damage(uid: u64, skill: u32, value: u64, crit: bool, lucky: bool) -> Event {
        Event::Damage {
            uid,
            target: 900,
            skill,
            element: 0,
            value,
            flags: HitFlags { crit, lucky, cause_lucky: false },
            hp_lessen: value,
        }
    }

    #[test]
    fn snapshot_single_damage() {
        let shared = SharedModel::new(EngineSettings::default());
        shared.apply_batch(&[damage(42, 1241, 1000, false, false)], 10);
        let all = shared.snapshot_all_at(20);
        assert_eq!(all.len(), 1);
        let a = &all[0];
        assert_eq!(a.uid, 42);
        assert_eq!(a.total_damage.total, 1000);
        assert_eq!(a.total_count.normal, 1);
        assert_eq!(a.sub_profession, "射线");
    }

    #[test]
    fn crit_cause_lucky_bin() {
        let shared = SharedModel::new(EngineSettings::default());
        shared.apply_batch(
            &[Event::Damage {
                uid: 42,
                target: 0,
                skill: 9999,
                element: 0,
                value: 500,
                flags: HitFlags { crit: true, lucky: false, cause_lucky: true },
                hp_lessen: 0,
            }],
            10,
        );
        let all = shared.snapshot_all_at(20);
        assert_eq!(all[0].total_count.crit_lucky, 1);
        assert_eq!(all[0].total_damage.crit_lucky, 500);
        assert_eq!(all[0].total_count.total, 1);
    }

    #[test]
    fn window_expiry_visible_in_snapshot() {
        let shared = SharedModel::new(EngineSettings::default());
        shared.apply_batch(&[damage(1, 5, 100, false, false)], 0);
        shared.apply_batch(&[damage(1, 5, 100, false, false)], 500);
        let now = shared.snapshot_all_at(500);
        assert_eq!(now[0].realtime_dps, 200);
        let later = shared.snapshot_all_at(1600);
        assert_eq!(later[0].realtime_dps, 0);
        assert_eq!(later[0].realtime_dps_max, 200);
    }

    #[test]
    fn pause_between_damage_events() {
        let shared = SharedModel::new(EngineSettings::default());
        shared.apply_batch(&[damage(1, 5, 100, false, false)], 10);
        shared.control(ControlOp::Pause);
        shared.apply_batch(&[damage(1, 5, 100, false, false)], 20);
        shared.control(ControlOp::Resume);
        shared.apply_batch(&[damage(1, 5, 100, false, false)], 30);
        let all = shared.snapshot_all_at(40);
        assert_eq!(all[0].total_damage.total, 200);
    }

    #[test]
    fn local_actor_sorts_first() {
        let shared = SharedModel::new(EngineSettings::default());
        shared.apply_batch(
            &[
                damage(1, 5, 9000, false, false),
                Event::SelfIdentify { uid: 2 },
                damage(2, 5, 10, false, false),
            ],
            10,
        );
        let all = shared.snapshot_all_at(20);
        assert!(all[0].is_local);
        assert_eq!(all[0].uid, 2);
    }

    #[test]
    fn skill_breakdown_separates_heal_keys() {
        let shared = SharedModel::new(EngineSettings::default());
        shared.apply_batch(
            &[
                damage(7, 20301, 300, false, false),
                Event::Healing {
                    uid: 7,
                    target: 7,
                    skill: 20301,
                    element: 0,
                    value: 200,
                    flags: HitFlags::default(),
                },
            ],
            10,
        );
        let skills = shared.snapshot_skills_at(7, 20).unwrap();
        assert_eq!(skills.len(), 2);
        let heal = skills.iter().find(|s| s.is_heal).unwrap();
        assert_eq!(heal.value.total, 200);
        assert_eq!(heal.skill_id, 20301 + HEAL_KEY_OFFSET);
        assert!(shared.snapshot_skills_at(999, 20).is_none());
    }

    #[test]
    fn actors_without_name_or_stats_hidden() {
        let shared = SharedModel::new(EngineSettings::default());
        shared.apply_batch(
            &[Event::AttrUpdate { uid: 11, key: crate::decoder::attr::HP, value: 100 }],
            10,
        );
        assert!(shared.snapshot_all_at(20).is_empty());
        // Once a name is learned the actor surfaces.
        shared.control(ControlOp::SetName { uid: 11, name: "观察者".into() });
        let all = shared.snapshot_all_at(30);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "观察者");
    }

    #[test]
    fn clear_resets_everything() {
        let shared = SharedModel::new(EngineSettings::default());
        shared.apply_batch(&[damage(1, 5, 100, false, false)], 10);
        shared.control(ControlOp::Clear);
        assert!(shared.snapshot_all().is_empty());
    }
}
