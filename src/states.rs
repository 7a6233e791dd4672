//! Mower state codes.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Activity category a state code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Category {
    #[default]
    Dock,
    Moving,
    Pause,
    Help,
}

impl Category {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "dock" => Self::Dock,
            "moving" => Self::Moving,
            "pause" => Self::Pause,
            "hilfe" | "help" => Self::Help,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Dock => "dock",
            Self::Moving => "moving",
            Self::Pause => "pause",
            Self::Help => "hilfe",
        }
    }

    /// `(docked, moving, pause, help)` with exactly one flag set.
    pub(crate) fn flags(self) -> [(&'static str, bool); 4] {
        [
            ("docked", self == Self::Dock),
            ("moving", self == Self::Moving),
            ("pause", self == Self::Pause),
            ("help", self == Self::Help),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StateCode {
    Known {
        code: u32,
        text: String,
        category: Category,
    },
    Unknown(u32),
}

impl StateCode {
    pub(crate) fn code(&self) -> u32 {
        match self {
            Self::Known { code, .. } | Self::Unknown(code) => *code,
        }
    }

    pub(crate) fn text(&self) -> String {
        match self {
            Self::Known { text, .. } => text.clone(),
            Self::Unknown(code) => format!("{code} unknown"),
        }
    }

    pub(crate) fn category(&self) -> Option<Category> {
        match self {
            Self::Known { category, .. } => Some(*category),
            Self::Unknown(_) => None,
        }
    }
}

/// Codes during which the mower is on the lawn and its position is worth sampling.
pub(crate) fn is_active(code: u32) -> bool {
    matches!(code, 513 | 514 | 515 | 518)
}

/// Codes that end an active phase: heading home, finished, or back on the dock.
pub(crate) fn is_terminal(code: u32) -> bool {
    matches!(
        code,
        257 | 260 | 261 | 262 | 263 | 769 | 770 | 771 | 772 | 773 | 774 | 775
    )
}

/// Code to description/category table, user editable through the `states_str`
/// item. Codes the table has never seen are remembered so the user can name them.
#[derive(Debug, Clone)]
pub(crate) struct StateTable {
    entries: BTreeMap<u32, (String, Category)>,
    unknown: BTreeSet<u32>,
}

impl Default for StateTable {
    fn default() -> Self {
        use Category::*;
        let entries = [
            (0, "Lese Status", Dock),
            (101, "Mäher angehoben", Help),
            (257, "Lädt", Dock),
            (258, "Angedockt", Dock),
            (259, "Angedockt - Software Update", Dock),
            (260, "Lädt", Dock),
            (261, "Angedockt", Dock),
            (262, "Angedockt - Lade Karte", Dock),
            (263, "Angedockt - Speichere Karte", Dock),
            (266, "Verlässt Station", Moving),
            (512, "Mähen - Verlässt Station", Moving),
            (513, "Schneide Rand", Moving),
            (514, "Mähen - Bestimme Ort", Moving),
            (515, "Lade Karte", Moving),
            (516, "Lerne Rasen", Moving),
            (517, "Pause", Pause),
            (518, "Mähe", Moving),
            (519, "Im Rasen untätig", Pause),
            (520, "Lerne Rasen", Moving),
            (521, "Pause", Pause),
            (523, "Spot-Mähen", Moving),
            (524, "Mähen - Zufall", Moving),
            (525, "Diagnosemodus", Help),
            (768, "Fährt zur Station", Moving),
            (769, "Fährt zur Station", Moving),
            (770, "Fährt zur Station", Moving),
            (771, "Fährt zur Station - Akku leer", Moving),
            (772, "Mähzeit beendet", Moving),
            (773, "Fährt zur Station - Akkutemperatur", Moving),
            (774, "Fährt zur Station - auf Anforderung", Moving),
            (775, "Fertig gemäht", Moving),
            (776, "Fährt zur Station - Bestimme Ort", Moving),
            (1005, "Verbindung zur Station fehlgeschlagen", Help),
            (1025, "Diagnosemodus", Help),
            (1026, "Lebensende", Help),
            (1027, "Service angefordert", Help),
            (1038, "Mäher blockiert", Help),
            (1281, "Software Update", Dock),
            (1537, "Festgefahren, Hilfe benötigt", Help),
        ]
        .into_iter()
        .map(|(code, text, category)| (code, (text.to_string(), category)))
        .collect();
        Self {
            entries,
            unknown: BTreeSet::new(),
        }
    }
}

impl StateTable {
    /// Load the table from the `{"<code>": ["text", "category"]}` form stored in
    /// the item tree. Entries with an unrecognised category are kept as unknown.
    pub(crate) fn from_entries(entries: &BTreeMap<i64, Value>) -> Self {
        let mut table = Self {
            entries: BTreeMap::new(),
            unknown: BTreeSet::new(),
        };
        for (code, entry) in entries {
            let Ok(code) = u32::try_from(*code) else {
                tracing::warn!(code, "ignoring a negative state code");
                continue;
            };
            let text = entry.get(0).and_then(Value::as_str);
            let category = entry.get(1).and_then(Value::as_str).and_then(Category::parse);
            match (text, category) {
                (Some(text), Some(category)) => {
                    table.entries.insert(code, (text.to_string(), category));
                }
                _ => {
                    table.unknown.insert(code);
                }
            }
        }
        table
    }

    pub(crate) fn lookup(&self, code: u32) -> StateCode {
        match self.entries.get(&code) {
            Some((text, category)) => StateCode::Known {
                code,
                text: text.clone(),
                category: *category,
            },
            None => StateCode::Unknown(code),
        }
    }

    /// Look `code` up and remember it if it is new. Returns whether the set of
    /// unknown codes grew.
    pub(crate) fn observe(&mut self, code: u32) -> (StateCode, bool) {
        let state = self.lookup(code);
        let grew = matches!(state, StateCode::Unknown(_)) && self.unknown.insert(code);
        if grew {
            tracing::info!(code, "new unknown state code");
        }
        (state, grew)
    }

    #[cfg(test)]
    pub(crate) fn unknown(&self) -> impl Iterator<Item = u32> + '_ {
        self.unknown.iter().copied()
    }

    /// Serialised form for the `states_str` item, unknown codes included.
    pub(crate) fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (code, (text, category)) in &self.entries {
            map.insert(code.to_string(), serde_json::json!([text, category.as_str()]));
        }
        for code in &self.unknown {
            map.insert(
                code.to_string(),
                serde_json::json!([format!("{code} unknown"), "unknown"]),
            );
        }
        Value::Object(map)
    }
}
