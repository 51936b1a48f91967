// src/decoder.rs
//
// Record kind -> message schema. All integers little-endian. Each kind maps
// to at most one message layout; short bodies are schema errors, unknown
// kinds are counted and otherwise ignored.
use crate::framing::Record;
use crate::metrics;

/// Record kind tags.
pub mod kind {
    /// Keepalive, empty body.
    pub const HEARTBEAT: u16 = 0x0001;
    /// Zstd container of concatenated inner records.
    pub const NOTIFY_BATCH: u16 = 0x0002;

    pub const DAMAGE: u16 = 0x0A01;
    pub const HEAL: u16 = 0x0A02;
    pub const TAKE_DAMAGE: u16 = 0x0A03;

    pub const ATTR_UPDATE: u16 = 0x0B01;

    pub const ENTITY_SPAWN: u16 = 0x0C01;
    pub const ENTITY_INFO: u16 = 0x0C02;

    pub const SCENE_CHANGE: u16 = 0x0D01;
    pub const SELF_IDENTIFY: u16 = 0x0E01;
}

/// Hit-outcome bits carried on damage/heal messages.
pub mod flag {
    pub const CRIT: u8 = 1 << 0;
    pub const LUCKY: u8 = 1 << 1;
    pub const CAUSE_LUCKY: u8 = 1 << 2;
    pub const LETHAL: u8 = 1 << 3;
}

/// Attribute keys understood by the dispatcher; anything else lands in the
/// actor's residual map.
pub mod attr {
    pub const HP: u16 = 1;
    pub const MAX_HP: u16 = 2;
    pub const FIGHT_POINT: u16 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HitFlags {
    pub crit: bool,
    pub lucky: bool,
    pub cause_lucky: bool,
}

impl HitFlags {
    #[inline]
    pub fn from_bits(b: u8) -> Self {
        Self {
            crit: b & flag::CRIT != 0,
            lucky: b & flag::LUCKY != 0,
            cause_lucky: b & flag::CAUSE_LUCKY != 0,
        }
    }

    #[inline]
    pub fn to_bits(self) -> u8 {
        let mut b = 0;
        if self.crit {
            b |= flag::CRIT;
        }
        if self.lucky {
            b |= flag::LUCKY;
        }
        if self.cause_lucky {
            b |= flag::CAUSE_LUCKY;
        }
        b
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Damage {
        uid: u64,
        target: u64,
        skill: u32,
        element: u8,
        value: u64,
        flags: HitFlags,
        hp_lessen: u64,
    },
    Healing {
        uid: u64,
        target: u64,
        skill: u32,
        element: u8,
        value: u64,
        flags: HitFlags,
    },
    TakeDamage {
        uid: u64,
        value: u64,
        lethal: bool,
    },
    AttrUpdate {
        uid: u64,
        key: u16,
        value: i64,
    },
    EntitySpawn {
        id: u64,
        name: String,
        max_hp: i64,
    },
    EntityInfo {
        id: u64,
        hp: i64,
        max_hp: i64,
    },
    SceneChange {
        scene_id: u32,
    },
    SelfIdentify {
        uid: u64,
    },
    /// Counted, never dispatched.
    Other(u16),
}

#[inline]
pub fn is_known_kind(k: u16) -> bool {
    matches!(
        k,
        kind::HEARTBEAT
            | kind::NOTIFY_BATCH
            | kind::DAMAGE
            | kind::HEAL
            | kind::TAKE_DAMAGE
            | kind::ATTR_UPDATE
            | kind::ENTITY_SPAWN
            | kind::ENTITY_INFO
            | kind::SCENE_CHANGE
            | kind::SELF_IDENTIFY
    )
}

#[inline]
pub fn is_compressed_kind(k: u16) -> bool {
    k == kind::NOTIFY_BATCH
}

// Bounds-checked little-endian cursor reads.

#[inline]
fn read_fixed<'a, const N: usize>(b: &'a [u8], off: &mut usize) -> Option<&'a [u8; N]> {
    if *off + N <= b.len() {
        let s = &b[*off..*off + N];
        *off += N;
        Some(s.try_into().unwrap())
    } else {
        None
    }
}

#[inline]
fn read_u8(b: &[u8], off: &mut usize) -> Option<u8> {
    read_fixed::<1>(b, off).map(|v| v[0])
}
#[inline]
fn read_u16(b: &[u8], off: &mut usize) -> Option<u16> {
    read_fixed::<2>(b, off).map(|v| u16::from_le_bytes(*v))
}
#[inline]
fn read_u32(b: &[u8], off: &mut usize) -> Option<u32> {
    read_fixed::<4>(b, off).map(|v| u32::from_le_bytes(*v))
}
#[inline]
fn read_u64(b: &[u8], off: &mut usize) -> Option<u64> {
    read_fixed::<8>(b, off).map(|v| u64::from_le_bytes(*v))
}
#[inline]
fn read_i64(b: &[u8], off: &mut usize) -> Option<i64> {
    read_fixed::<8>(b, off).map(|v| i64::from_le_bytes(*v))
}

fn read_string(b: &[u8], off: &mut usize) -> Option<String> {
    let n = read_u16(b, off)? as usize;
    if *off + n > b.len() {
        return None;
    }
    let s = String::from_utf8_lossy(&b[*off..*off + n]).into_owned();
    *off += n;
    Some(s)
}

/// Decode one record into zero or more events. Schema mismatches count and
/// yield nothing; unknown kinds yield `Other`.
pub fn decode_into(rec: &Record, out: &mut Vec<Event>) {
    let b = rec.body.as_slice();
    let mut o = 0usize;
    let ev = match rec.kind {
        kind::HEARTBEAT => return,
        kind::DAMAGE => (|| {
            let uid = read_u64(b, &mut o)?;
            let target = read_u64(b, &mut o)?;
            let skill = read_u32(b, &mut o)?;
            let element = read_u8(b, &mut o)?;
            let flags = HitFlags::from_bits(read_u8(b, &mut o)?);
            let value = read_i64(b, &mut o)?;
            let hp_lessen = read_i64(b, &mut o)?.max(0) as u64;
            // Zero-value hits (misses, absorbs) carry no statistic.
            if value <= 0 {
                return None;
            }
            Some(Event::Damage {
                uid,
                target,
                skill,
                element,
                value: value as u64,
                flags,
                hp_lessen,
            })
        })(),
        kind::HEAL => (|| {
            let uid = read_u64(b, &mut o)?;
            let target = read_u64(b, &mut o)?;
            let skill = read_u32(b, &mut o)?;
            let element = read_u8(b, &mut o)?;
            let flags = HitFlags::from_bits(read_u8(b, &mut o)?);
            let value = read_i64(b, &mut o)?;
            if value <= 0 {
                return None;
            }
            Some(Event::Healing { uid, target, skill, element, value: value as u64, flags })
        })(),
        kind::TAKE_DAMAGE => (|| {
            let uid = read_u64(b, &mut o)?;
            let value = read_i64(b, &mut o)?.max(0) as u64;
            let bits = read_u8(b, &mut o)?;
            Some(Event::TakeDamage { uid, value, lethal: bits & flag::LETHAL != 0 })
        })(),
        kind::ATTR_UPDATE => (|| {
            let uid = read_u64(b, &mut o)?;
            let key = read_u16(b, &mut o)?;
            let value = read_i64(b, &mut o)?;
            Some(Event::AttrUpdate { uid, key, value })
        })(),
        kind::ENTITY_SPAWN => (|| {
            let id = read_u64(b, &mut o)?;
            let name = read_string(b, &mut o)?;
            let max_hp = read_i64(b, &mut o)?;
            Some(Event::EntitySpawn { id, name, max_hp })
        })(),
        kind::ENTITY_INFO => (|| {
            let id = read_u64(b, &mut o)?;
            let hp = read_i64(b, &mut o)?;
            let max_hp = read_i64(b, &mut o)?;
            Some(Event::EntityInfo { id, hp, max_hp })
        })(),
        kind::SCENE_CHANGE => (|| {
            let scene_id = read_u32(b, &mut o)?;
            Some(Event::SceneChange { scene_id })
        })(),
        kind::SELF_IDENTIFY => (|| {
            let uid = read_u64(b, &mut o)?;
            Some(Event::SelfIdentify { uid })
        })(),
        other => {
            metrics::inc_unknown_kind();
            out.push(Event::Other(other));
            return;
        }
    };
    match ev {
        Some(ev) => out.push(ev),
        None => {
            // Zero-value payloads are silent; a truncated layout is a
            // schema error.
            if b.len() < expected_min_len(rec.kind) {
                metrics::inc_record_schema_error();
            }
        }
    }
}

fn expected_min_len(k: u16) -> usize {
    match k {
        kind::DAMAGE => 8 + 8 + 4 + 1 + 1 + 8 + 8,
        kind::HEAL => 8 + 8 + 4 + 1 + 1 + 8,
        kind::TAKE_DAMAGE => 8 + 8 + 1,
        kind::ATTR_UPDATE => 8 + 2 + 8,
        kind::ENTITY_SPAWN => 8 + 2 + 8,
        kind::ENTITY_INFO => 8 + 8 + 8,
        kind::SCENE_CHANGE => 4,
        kind::SELF_IDENTIFY => 8,
        _ => 0,
    }
}

// Body builders for the known layouts. The engine itself never encodes; these
// exist for tests and synthetic feeds.
pub mod build {
    use super::*;

    pub fn damage(
        uid: u64,
        target: u64,
        skill: u32,
        element: u8,
        value: i64,
        flags: HitFlags,
        hp_lessen: i64,
    ) -> Vec<u8> {
        let mut v = Vec::with_capacity(38);
        v.extend_from_slice(&uid.to_le_bytes());
        v.extend_from_slice(&target.to_le_bytes());
        v.extend_from_slice(&skill.to_le_bytes());
        v.push(element);
        v.push(flags.to_bits());
        v.extend_from_slice(&value.to_le_bytes());
        v.extend_from_slice(&hp_lessen.to_le_bytes());
        v
    }

    pub fn heal(
        uid: u64,
        target: u64,
        skill: u32,
        element: u8,
        value: i64,
        flags: HitFlags,
    ) -> Vec<u8> {
        let mut v = Vec::with_capacity(30);
        v.extend_from_slice(&uid.to_le_bytes());
        v.extend_from_slice(&target.to_le_bytes());
        v.extend_from_slice(&skill.to_le_bytes());
        v.push(element);
        v.push(flags.to_bits());
        v.extend_from_slice(&value.to_le_bytes());
        v
    }

    pub fn take_damage(uid: u64, value: i64, lethal: bool) -> Vec<u8> {
        let mut v = Vec::with_capacity(17);
        v.extend_from_slice(&uid.to_le_bytes());
        v.extend_from_slice(&value.to_le_bytes());
        v.push(if lethal { flag::LETHAL } else { 0 });
        v
    }

    pub fn attr_update(uid: u64, key: u16, value: i64) -> Vec<u8> {
        let mut v = Vec::with_capacity(18);
        v.extend_from_slice(&uid.to_le_bytes());
        v.extend_from_slice(&key.to_le_bytes());
        v.extend_from_slice(&value.to_le_bytes());
        v
    }

    pub fn entity_spawn(id: u64, name: &str, max_hp: i64) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&id.to_le_bytes());
        v.extend_from_slice(&(name.len() as u16).to_le_bytes());
        v.extend_from_slice(name.as_bytes());
        v.extend_from_slice(&max_hp.to_le_bytes());
        v
    }

    pub fn entity_info(id: u64, hp: i64, max_hp: i64) -> Vec<u8> {
        let mut v = Vec::with_capacity(24);
        v.extend_from_slice(&id.to_le_bytes());
        v.extend_from_slice(&hp.to_le_bytes());
        v.extend_from_slice(&max_hp.to_le_bytes());
        v
    }

    pub fn scene_change(scene_id: u32) -> Vec<u8> {
        scene_id.to_le_bytes().to_vec()
    }

    pub fn self_identify(uid: u64) -> Vec<u8> {
        uid.to_le_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(k: u16, body: Vec<u8>) -> Vec<Event> {
        let mut out = Vec::new();
        decode_into(&Record { kind: k, body }, &mut out);
        out
    }

    #[test]
    fn damage_round_trip() {
        let flags = HitFlags { crit: true, lucky: false, cause_lucky: true };
        let body = build::damage(42, 9000, 1241, 2, 1000, flags, 950);
        let evs = decode_one(kind::DAMAGE, body);
        assert_eq!(
            evs,
            vec![Event::Damage {
                uid: 42,
                target: 9000,
                skill: 1241,
                element: 2,
                value: 1000,
                flags,
                hp_lessen: 950,
            }]
        );
    }

    #[test]
    fn heal_round_trip() {
        let body = build::heal(7, 7, 20301, 0, 555, HitFlags::default());
        let evs = decode_one(kind::HEAL, body);
        assert_eq!(
            evs,
            vec![Event::Healing {
                uid: 7,
                target: 7,
                skill: 20301,
                element: 0,
                value: 555,
                flags: HitFlags::default(),
            }]
        );
    }

    #[test]
    fn take_damage_round_trip() {
        let evs = decode_one(kind::TAKE_DAMAGE, build::take_damage(3, 1234, true));
        assert_eq!(evs, vec![Event::TakeDamage { uid: 3, value: 1234, lethal: true }]);
    }

    #[test]
    fn attr_update_round_trip() {
        let evs = decode_one(kind::ATTR_UPDATE, build::attr_update(7, attr::FIGHT_POINT, 21000));
        assert_eq!(evs, vec![Event::AttrUpdate { uid: 7, key: attr::FIGHT_POINT, value: 21000 }]);
    }

    #[test]
    fn entity_spawn_round_trip() {
        let evs = decode_one(kind::ENTITY_SPAWN, build::entity_spawn(88, "邪恶的史莱姆", 40000));
        assert_eq!(
            evs,
            vec![Event::EntitySpawn { id: 88, name: "邪恶的史莱姆".into(), max_hp: 40000 }]
        );
    }

    #[test]
    fn entity_info_round_trip() {
        let evs = decode_one(kind::ENTITY_INFO, build::entity_info(88, 1200, 40_000));
        assert_eq!(evs, vec![Event::EntityInfo { id: 88, hp: 1200, max_hp: 40_000 }]);
    }

    #[test]
    fn scene_and_identify_round_trip() {
        assert_eq!(
            decode_one(kind::SCENE_CHANGE, build::scene_change(12)),
            vec![Event::SceneChange { scene_id: 12 }]
        );
        assert_eq!(
            decode_one(kind::SELF_IDENTIFY, build::self_identify(42)),
            vec![Event::SelfIdentify { uid: 42 }]
        );
    }

    #[test]
    fn zero_damage_yields_nothing() {
        let body = build::damage(42, 0, 1241, 0, 0, HitFlags::default(), 0);
        assert!(decode_one(kind::DAMAGE, body).is_empty());
    }

    #[test]
    fn unknown_kind_counts_as_other() {
        let evs = decode_one(0x7777, vec![1, 2, 3]);
        assert_eq!(evs, vec![Event::Other(0x7777)]);
    }

    #[test]
    fn truncated_body_yields_nothing() {
        let mut body = build::damage(42, 0, 1, 0, 10, HitFlags::default(), 0);
        body.truncate(10);
        assert!(decode_one(kind::DAMAGE, body).is_empty());
    }
}
