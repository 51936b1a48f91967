// src/model.rs
//
// The live combat model: a flat actor table keyed by uid, an enemy cache,
// and the dispatch rules that apply decoded events to them. Everything here
// is session-scoped; `clear` wipes combat data but never reference tables.
use crate::decoder::{attr, Event};
use crate::metrics;
use crate::reference;
use crate::stats::{Outcome, StatisticBlock, HEAL_KEY_OFFSET};
use hashbrown::HashMap;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub auto_clear_on_timeout: bool,
    pub idle_clear_ms: u64,
    pub clear_on_scene_change: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            auto_clear_on_timeout: true,
            idle_clear_ms: 20_000,
            clear_on_scene_change: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkillStat {
    pub element: u8,
    pub block: StatisticBlock,
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub uid: u64,
    pub name: String,
    pub profession: Option<u32>,
    pub sub_profession: String,
    /// Gear rating; monotonic non-decreasing within a session.
    pub fight_point: u64,
    pub hp: i64,
    pub max_hp: i64,
    pub dead_count: u32,
    pub taken_damage: u64,
    pub damage: StatisticBlock,
    pub healing: StatisticBlock,
    pub skills: HashMap<u64, SkillStat>,
    /// Residual attributes with no named field.
    pub attrs: HashMap<u16, i64>,
}

impl Actor {
    fn new(uid: u64) -> Self {
        Self {
            uid,
            name: format!("#{uid}"),
            profession: None,
            sub_profession: String::new(),
            fight_point: 0,
            hp: 0,
            max_hp: 0,
            dead_count: 0,
            taken_damage: 0,
            damage: StatisticBlock::default(),
            healing: StatisticBlock::default(),
            skills: HashMap::new(),
            attrs: HashMap::new(),
        }
    }

    pub fn has_display_name(&self) -> bool {
        !is_placeholder(&self.name)
    }

    /// Names stick once learned; only placeholders are overwritten.
    fn learn_name(&mut self, name: &str) {
        if is_placeholder(name) {
            return;
        }
        if is_placeholder(&self.name) {
            self.name = name.to_string();
        }
    }

    fn set_fight_point(&mut self, v: i64) {
        // Strictly monotonic: the wire sometimes reports a transient 0.
        if v > 0 && v as u64 > self.fight_point {
            self.fight_point = v as u64;
        }
    }
}

#[inline]
fn is_placeholder(name: &str) -> bool {
    name.is_empty() || name.starts_with('#')
}

#[derive(Debug, Clone, Default)]
pub struct Enemy {
    pub name: Option<String>,
    pub hp: Option<i64>,
    pub max_hp: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub name: Option<String>,
    pub profession: Option<u32>,
    pub fight_point: Option<u64>,
    pub max_hp: Option<i64>,
}

pub struct CombatModel {
    pub actors: HashMap<u64, Actor>,
    pub enemies: HashMap<u64, Enemy>,
    pub local_uid: Option<u64>,
    pub session_start_ms: u64,
    pub last_event_ms: u64,
    pub paused: bool,
    /// Bumped on every clear; guards stale background merges.
    pub generation: u64,
    settings: EngineSettings,
}

impl CombatModel {
    pub fn new(settings: EngineSettings, now_ms: u64) -> Self {
        Self {
            actors: HashMap::new(),
            enemies: HashMap::new(),
            local_uid: None,
            session_start_ms: now_ms,
            last_event_ms: 0,
            paused: false,
            generation: 0,
            settings,
        }
    }

    fn actor_mut(&mut self, uid: u64, newly_seen: &mut Vec<u64>) -> &mut Actor {
        self.actors.entry(uid).or_insert_with(|| {
            newly_seen.push(uid);
            Actor::new(uid)
        })
    }

    /// Apply one decoded event. `newly_seen` collects uids created by this
    /// event so the caller can schedule metadata fetches.
    pub fn apply(&mut self, ev: &Event, now_ms: u64, newly_seen: &mut Vec<u64>) {
        if self.paused {
            if !matches!(ev, Event::Other(_)) {
                metrics::inc_events_discarded_paused();
            }
            return;
        }
        match *ev {
            Event::Damage { uid, target: _, skill, element, value, flags, hp_lessen } => {
                self.last_event_ms = now_ms;
                let a = self.actor_mut(uid, newly_seen);
                let outcome = Outcome::classify(flags.crit, flags.lucky || flags.cause_lucky);
                a.damage.record(value, hp_lessen, outcome, now_ms);
                let s = a.skills.entry(skill as u64).or_default();
                s.element = element;
                s.block.record(value, hp_lessen, outcome, now_ms);
                if let Some(sub) = reference::sub_profession_for_skill(skill) {
                    a.sub_profession = sub.to_string();
                }
                metrics::inc_events(1);
            }
            Event::Healing { uid, target: _, skill, element, value, flags } => {
                // uid 0 is anonymous environment healing; not a combatant.
                if uid == 0 {
                    metrics::inc_events_ignored();
                    return;
                }
                self.last_event_ms = now_ms;
                let a = self.actor_mut(uid, newly_seen);
                let outcome = Outcome::classify(flags.crit, flags.lucky || flags.cause_lucky);
                a.healing.record(value, 0, outcome, now_ms);
                let s = a.skills.entry(skill as u64 + HEAL_KEY_OFFSET).or_default();
                s.element = element;
                s.block.record(value, 0, outcome, now_ms);
                if let Some(sub) = reference::sub_profession_for_skill(skill) {
                    a.sub_profession = sub.to_string();
                }
                metrics::inc_events(1);
            }
            Event::TakeDamage { uid, value, lethal } => {
                self.last_event_ms = now_ms;
                let a = self.actor_mut(uid, newly_seen);
                a.taken_damage += value;
                if lethal {
                    a.dead_count += 1;
                }
                metrics::inc_events(1);
            }
            Event::AttrUpdate { uid, key, value } => {
                self.last_event_ms = now_ms;
                let a = self.actor_mut(uid, newly_seen);
                match key {
                    attr::HP => a.hp = value,
                    attr::MAX_HP => {
                        if value != 0 {
                            a.max_hp = value;
                        }
                    }
                    attr::FIGHT_POINT => a.set_fight_point(value),
                    other => {
                        a.attrs.insert(other, value);
                    }
                }
                metrics::inc_events(1);
            }
            Event::EntitySpawn { id, ref name, max_hp } => {
                self.last_event_ms = now_ms;
                let e = self.enemies.entry(id).or_default();
                if !name.is_empty() {
                    e.name = Some(name.clone());
                }
                if max_hp != 0 {
                    e.max_hp = Some(max_hp);
                }
                metrics::inc_events(1);
            }
            Event::EntityInfo { id, hp, max_hp } => {
                self.last_event_ms = now_ms;
                let e = self.enemies.entry(id).or_default();
                e.hp = Some(hp);
                if max_hp != 0 {
                    e.max_hp = Some(max_hp);
                }
                metrics::inc_events(1);
            }
            Event::SceneChange { scene_id } => {
                log::info!("scene change -> {scene_id}");
                if self.settings.clear_on_scene_change {
                    self.clear(now_ms);
                }
                metrics::inc_events(1);
            }
            Event::SelfIdentify { uid } => {
                self.last_event_ms = now_ms;
                self.local_uid = Some(uid);
                self.actor_mut(uid, newly_seen);
                metrics::inc_events(1);
            }
            Event::Other(_) => {
                metrics::inc_events_ignored();
            }
        }
    }

    /// Merge a background metadata fetch. Results from before the last clear
    /// carry a stale generation and are dropped.
    pub fn apply_remote(&mut self, uid: u64, generation: u64, info: &RemoteInfo) -> bool {
        if generation != self.generation {
            return false;
        }
        let mut scratch = Vec::new();
        let a = self.actor_mut(uid, &mut scratch);
        if let Some(ref n) = info.name {
            a.learn_name(n);
        }
        if let Some(p) = info.profession {
            a.profession = Some(p);
        }
        if let Some(fp) = info.fight_point {
            a.set_fight_point(fp as i64);
        }
        if let Some(mh) = info.max_hp {
            if mh != 0 {
                a.max_hp = mh;
            }
        }
        true
    }

    /// Explicit name override from the control surface.
    pub fn set_name(&mut self, uid: u64, name: &str) {
        let mut scratch = Vec::new();
        let a = self.actor_mut(uid, &mut scratch);
        a.name = name.to_string();
    }

    pub fn clear(&mut self, now_ms: u64) {
        self.actors.clear();
        self.enemies.clear();
        self.session_start_ms = now_ms;
        self.last_event_ms = 0;
        self.generation += 1;
        log::info!("combat data cleared, new session at {now_ms}");
    }

    /// Idle wipe, checked by the worker between batches. Returns true when a
    /// clear happened.
    pub fn maybe_idle_clear(&mut self, now_ms: u64) -> bool {
        if !self.settings.auto_clear_on_timeout {
            return false;
        }
        if self.actors.is_empty() || self.last_event_ms == 0 {
            return false;
        }
        if now_ms.saturating_sub(self.last_event_ms) > self.settings.idle_clear_ms {
            self.clear(now_ms);
            return true;
        }
        false
    }
}
