// src/reference.rs
//
// Read-only reference data: professions, skill names, monster names, and the
// skill-id -> specialization table the dispatcher uses to infer an actor's
// sub-class. Immutable after startup; packet handling only reads.
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Dps,
    Tank,
    Healer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locale {
    Zh,
    En,
}

#[derive(Debug, Clone, Copy)]
pub struct Profession {
    pub id: u32,
    pub zh: &'static str,
    pub en: &'static str,
    pub role: Role,
}

const PROFESSIONS: &[Profession] = &[
    Profession { id: 1, zh: "雷影剑士", en: "Stormblade", role: Role::Dps },
    Profession { id: 2, zh: "冰魔导师", en: "Frost Mage", role: Role::Dps },
    Profession { id: 3, zh: "涤罪恶火", en: "Pyroclast", role: Role::Dps },
    Profession { id: 4, zh: "青岚骑士", en: "Wind Knight", role: Role::Tank },
    Profession { id: 5, zh: "森语者", en: "Verdant Oracle", role: Role::Healer },
    Profession { id: 8, zh: "神射手", en: "Marksman", role: Role::Dps },
    Profession { id: 9, zh: "神盾骑士", en: "Shield Knight", role: Role::Tank },
    Profession { id: 10, zh: "灵魂乐手", en: "Soul Musician", role: Role::Healer },
];

/// Specializations inferred from signature skills. Keyed by skill id; the
/// value is the localized sub-class name shown in summaries.
const SUB_PROFESSION_SKILLS: &[(u32, &str)] = &[
    // 神射手
    (1241, "射线"),
    (1249, "射线"),
    (2031, "驭兽"),
    (2037, "驭兽"),
    // 雷影剑士
    (1714, "居合"),
    (1734, "居合"),
    (44701, "月刃"),
    (44706, "月刃"),
    // 冰魔导师
    (120901, "冰矛"),
    (120902, "冰矛"),
    (1240, "冰箭"),
    (1245, "冰箭"),
    // 森语者
    (1518, "惩戒"),
    (1541, "惩戒"),
    (20301, "愈合"),
    (20325, "愈合"),
    // 神盾骑士
    (2405, "防盾"),
    (2406, "防盾"),
    (199902, "光盾"),
    (199907, "光盾"),
    // 灵魂乐手
    (2306, "狂音"),
    (2307, "狂音"),
    (1419, "协奏"),
    (1421, "协奏"),
];

const SKILL_NAMES: &[(u32, &str, &str)] = &[
    (1241, "聚能射线", "Focused Beam"),
    (1249, "贯穿射线", "Piercing Beam"),
    (2031, "兽王召唤", "Beast Call"),
    (1714, "居合斩", "Iaido Slash"),
    (44701, "月刃回旋", "Moonblade Sweep"),
    (120901, "寒冰之矛", "Glacial Spear"),
    (1240, "冰霜箭", "Frost Bolt"),
    (1518, "自然惩戒", "Nature's Rebuke"),
    (20301, "生命绽放", "Lifebloom"),
    (20325, "愈合之风", "Mending Breeze"),
    (2405, "盾击", "Shield Bash"),
    (199902, "圣光壁垒", "Radiant Bulwark"),
    (2306, "狂想音浪", "Sonic Frenzy"),
    (1419, "协奏圆舞", "Concerto Waltz"),
];

const MONSTER_NAMES: &[(u64, &str, &str)] = &[
    (60001, "邪恶的史莱姆", "Vile Slime"),
    (60002, "荒野狼王", "Feral Wolf King"),
    (60100, "岩壳巨蟹", "Stoneshell Crab"),
    (61005, "深渊看守", "Abyss Warden"),
    (62001, "雷暴龙蜥", "Storm Drake"),
];

static PROFESSION_BY_ID: Lazy<HashMap<u32, &'static Profession>> =
    Lazy::new(|| PROFESSIONS.iter().map(|p| (p.id, p)).collect());

static PROFESSION_BY_NAME: Lazy<HashMap<&'static str, &'static Profession>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for p in PROFESSIONS {
        m.insert(p.zh, p);
        m.insert(p.en, p);
    }
    m
});

static SUB_PROFESSION_BY_SKILL: Lazy<HashMap<u32, &'static str>> =
    Lazy::new(|| SUB_PROFESSION_SKILLS.iter().copied().collect());

static SKILL_BY_ID: Lazy<HashMap<u32, (&'static str, &'static str)>> =
    Lazy::new(|| SKILL_NAMES.iter().map(|&(id, zh, en)| (id, (zh, en))).collect());

static SKILL_BY_NAME: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for &(id, zh, en) in SKILL_NAMES {
        m.insert(zh, id);
        m.insert(en, id);
    }
    m
});

static MONSTER_BY_ID: Lazy<HashMap<u64, (&'static str, &'static str)>> =
    Lazy::new(|| MONSTER_NAMES.iter().map(|&(id, zh, en)| (id, (zh, en))).collect());

static MONSTER_BY_NAME: Lazy<HashMap<&'static str, u64>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for &(id, zh, en) in MONSTER_NAMES {
        m.insert(zh, id);
        m.insert(en, id);
    }
    m
});

pub fn profession_by_id(id: u32) -> Option<&'static Profession> {
    PROFESSION_BY_ID.get(&id).copied()
}

pub fn profession_by_name(name: &str) -> Option<&'static Profession> {
    PROFESSION_BY_NAME.get(name).copied()
}

pub fn profession_name(id: u32, locale: Locale) -> Option<&'static str> {
    profession_by_id(id).map(|p| match locale {
        Locale::Zh => p.zh,
        Locale::En => p.en,
    })
}

/// Sub-class implied by a signature skill, if any.
pub fn sub_profession_for_skill(skill: u32) -> Option<&'static str> {
    SUB_PROFESSION_BY_SKILL.get(&skill).copied()
}

pub fn skill_name(id: u32, locale: Locale) -> Option<&'static str> {
    SKILL_BY_ID.get(&id).map(|&(zh, en)| match locale {
        Locale::Zh => zh,
        Locale::En => en,
    })
}

pub fn skill_by_name(name: &str) -> Option<u32> {
    SKILL_BY_NAME.get(name).copied()
}

pub fn monster_name(id: u64, locale: Locale) -> Option<&'static str> {
    MONSTER_BY_ID.get(&id).map(|&(zh, en)| match locale {
        Locale::Zh => zh,
        Locale::En => en,
    })
}

pub fn monster_by_name(name: &str) -> Option<u64> {
    MONSTER_BY_NAME.get(name).copied()
}
