//! Entity identity and listing types

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric character ID as embedded in EVE log file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(EntityId)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId(id)
    }
}

/// A character found in the gamelog directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub id: EntityId,
    /// Timestamp token of the character's most recent gamelog.
    pub last_seen: NaiveDateTime,
}

impl Character {
    /// Display label used when no name is known.
    pub fn label(&self) -> String {
        format!("Character {}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let id: EntityId = " 90000001 ".parse().unwrap();
        assert_eq!(id, EntityId(90000001));
        assert_eq!(id.to_string(), "90000001");
        assert!("abc".parse::<EntityId>().is_err());
    }

    #[test]
    fn json_map_key_roundtrip() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(EntityId(501), true);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"501":true}"#);

        let parsed: std::collections::BTreeMap<EntityId, bool> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.get(&EntityId(501)), Some(&true));
    }
}
