use crate::error::Error;
use crate::store::{ClanId, Status};
use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;

lazy_static! {
    // Upstream reports "19:15", older fronts report "19:15:00"
    static ref PRIME_TIME: Regex = Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?$").unwrap();
}

/// One raw territory record as polled from upstream. Field types are as
/// loose as the source: ids arrive as strings or ints between polls, lists
/// flip empty/non-empty, and most fields may be omitted entirely.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTerritory {
    #[serde(default)]
    pub territory_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub front_id: String,

    #[serde(default, deserialize_with = "opt_clan_id")]
    pub owner_clan_id: Option<ClanId>,

    #[serde(default)]
    pub arena_id: String,

    #[serde(default)]
    pub arena_name: String,

    #[serde(default)]
    pub server: String,

    #[serde(default)]
    pub prime_time: String,

    #[serde(default)]
    pub battles_start_at: String,

    #[serde(default, deserialize_with = "clan_id_list")]
    pub competitors: Vec<ClanId>,

    #[serde(default, deserialize_with = "clan_id_list")]
    pub attackers: Vec<ClanId>,

    #[serde(default)]
    pub landing_type: Option<String>,

    #[serde(default)]
    pub round_number: Option<i32>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub active_battles: Vec<RawActiveBattle>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawActiveBattle {
    #[serde(default)]
    pub round: Option<i32>,

    #[serde(default)]
    pub clan_a: RawBattleSide,

    #[serde(default)]
    pub clan_b: RawBattleSide,

    #[serde(default)]
    pub start_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBattleSide {
    #[serde(default, deserialize_with = "opt_clan_id")]
    pub clan_id: Option<ClanId>,
}

/// Clan ids arrive as numbers or strings depending on the endpoint and, for
/// some fields, on the day. Both forms decode to the numeric id; anything
/// unparseable degrades to `None`.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Num(u64),
    Text(String),
}

impl IdRepr {
    fn into_id(self) -> Option<ClanId> {
        match self {
            Self::Num(n) => Some(n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

pub(crate) fn opt_clan_id<'de, D>(deserializer: D) -> Result<Option<ClanId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<IdRepr>::deserialize(deserializer)?;
    Ok(raw.and_then(IdRepr::into_id))
}

fn clan_id_list<'de, D>(deserializer: D) -> Result<Vec<ClanId>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<IdRepr>::deserialize(deserializer)?;
    Ok(raw.into_iter().filter_map(IdRepr::into_id).collect())
}

/// Parses an upstream "YYYY-MM-DDTHH:MM:SS" datetime. No timezone is ever
/// sent; all upstream instants are UTC.
pub(crate) fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc())
}

fn parse_prime_time(value: &str) -> Option<NaiveTime> {
    let captures = PRIME_TIME.captures(value.trim())?;

    let hour: u32 = captures.get(1)?.as_str().parse().ok()?;
    let minute: u32 = captures.get(2)?.as_str().parse().ok()?;
    let second: u32 = match captures.get(3) {
        Some(s) => s.as_str().parse().ok()?,
        None => 0,
    };

    NaiveTime::from_hms_opt(hour, minute, second)
}

/// Canonical form of one polled territory record.
#[derive(Debug, Clone, PartialEq)]
pub struct TerritorySnapshot {
    pub territory_id: String,
    pub name: String,
    pub front_id: String,
    pub owner_clan_id: Option<ClanId>,
    pub arena_id: String,
    pub arena_name: String,
    pub server: String,
    pub prime_time: NaiveTime,
    pub battles_start_at: Option<DateTime<Utc>>,
    pub competitors: BTreeSet<ClanId>,
    pub attackers: BTreeSet<ClanId>,
    pub landing_type: Option<String>,
    pub round_number: Option<i32>,
    pub status: Option<Status>,
    pub active_battles: Vec<ActiveBattle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveBattle {
    pub round: i32,
    pub clan_a: ClanId,
    pub clan_b: ClanId,
    pub start_at: DateTime<Utc>,
}

/// Converts a raw territory record into its canonical form.
///
/// Only the identity fields are required: a missing territory id or an
/// unparseable prime time rejects the whole snapshot. Every other field is
/// known to be omitted by upstream now and then and degrades to empty or
/// `None` instead of failing.
pub fn normalize(raw: &RawTerritory) -> Result<TerritorySnapshot, Error> {
    if raw.territory_id.is_empty() {
        return Err(Error::malformed("<unknown>", "missing territory_id"));
    }

    let prime_time = parse_prime_time(&raw.prime_time).ok_or_else(|| {
        Error::malformed(
            &raw.territory_id,
            format!("unparseable prime_time {:?}", raw.prime_time),
        )
    })?;

    let battles_start_at = parse_instant(&raw.battles_start_at);

    let mut active_battles = Vec::with_capacity(raw.active_battles.len());
    for battle in &raw.active_battles {
        let (Some(clan_a), Some(clan_b)) = (battle.clan_a.clan_id, battle.clan_b.clan_id) else {
            // Upstream occasionally sends a battle with one competitor
            // missing; there is nothing to record a pairing against.
            warn!(
                "[normalize] no competitor pair in active battle: territory '{}', round {:?}",
                raw.territory_id, battle.round
            );
            continue;
        };

        let Some(start_at) = parse_instant(&battle.start_at) else {
            warn!(
                "[normalize] unparseable start_at {:?} in active battle: territory '{}'",
                battle.start_at, raw.territory_id
            );
            continue;
        };

        active_battles.push(ActiveBattle {
            round: battle.round.unwrap_or(1),
            clan_a,
            clan_b,
            start_at,
        });
    }

    Ok(TerritorySnapshot {
        territory_id: raw.territory_id.clone(),
        name: raw.name.clone(),
        front_id: raw.front_id.clone(),
        owner_clan_id: raw.owner_clan_id,
        arena_id: raw.arena_id.clone(),
        arena_name: raw.arena_name.clone(),
        server: raw.server.clone(),
        prime_time,
        battles_start_at,
        competitors: raw.competitors.iter().copied().collect(),
        attackers: raw.attackers.iter().copied().collect(),
        landing_type: raw.landing_type.clone(),
        round_number: raw.round_number,
        status: raw.status.as_deref().and_then(Status::parse),
        active_battles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawTerritory {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn it_normalizes_a_full_snapshot() {
        let raw = raw(json!({
            "territory_id": "aarhus",
            "name": "Aarhus",
            "front_id": "campaign_05_west",
            "owner_clan_id": 192,
            "arena_id": "10_hills",
            "arena_name": "Mines",
            "server": "RU6",
            "prime_time": "19:15",
            "battles_start_at": "2016-11-23T19:15:00",
            "competitors": [192, "3861"],
            "attackers": [],
            "landing_type": "tournament",
            "round_number": 2,
            "status": "STARTED",
            "active_battles": [{
                "round": 2,
                "clan_a": {"clan_id": 192},
                "clan_b": {"clan_id": "3861"},
                "start_at": "2016-11-23T19:45:00"
            }]
        }));

        let snapshot = normalize(&raw).unwrap();
        assert_eq!(snapshot.territory_id, "aarhus");
        assert_eq!(snapshot.owner_clan_id, Some(192));
        assert_eq!(snapshot.prime_time, NaiveTime::from_hms_opt(19, 15, 0).unwrap());
        assert_eq!(
            snapshot.battles_start_at,
            parse_instant("2016-11-23T19:15:00")
        );
        assert_eq!(
            snapshot.competitors,
            BTreeSet::from([192, 3861])
        );
        assert_eq!(snapshot.status, Some(Status::Started));
        assert_eq!(
            snapshot.active_battles,
            vec![ActiveBattle {
                round: 2,
                clan_a: 192,
                clan_b: 3861,
                start_at: parse_instant("2016-11-23T19:45:00").unwrap(),
            }]
        );
    }

    #[test]
    fn it_rejects_a_snapshot_without_a_territory_id() {
        let raw = raw(json!({"prime_time": "19:15"}));
        assert!(matches!(
            normalize(&raw),
            Err(Error::MalformedSnapshot { .. })
        ));
    }

    #[test]
    fn it_rejects_a_snapshot_without_a_prime_time() {
        let raw = raw(json!({"territory_id": "aarhus"}));
        assert!(matches!(
            normalize(&raw),
            Err(Error::MalformedSnapshot { .. })
        ));
    }

    #[test]
    fn it_degrades_everything_else_to_empty() {
        let raw = raw(json!({
            "territory_id": "aarhus",
            "prime_time": "19:15:00",
            "owner_clan_id": null,
            "round_number": null,
            "status": null
        }));

        let snapshot = normalize(&raw).unwrap();
        assert_eq!(snapshot.owner_clan_id, None);
        assert_eq!(snapshot.battles_start_at, None);
        assert_eq!(snapshot.round_number, None);
        assert_eq!(snapshot.status, None);
        assert!(snapshot.competitors.is_empty());
        assert!(snapshot.attackers.is_empty());
        assert!(snapshot.active_battles.is_empty());
    }

    #[test]
    fn it_skips_active_battles_missing_a_side_or_a_start() {
        let raw = raw(json!({
            "territory_id": "aarhus",
            "prime_time": "19:15",
            "active_battles": [
                {"round": 1, "clan_a": {"clan_id": 1}, "clan_b": {}, "start_at": "2016-11-23T19:15:00"},
                {"round": 1, "clan_a": {"clan_id": 1}, "clan_b": {"clan_id": 2}, "start_at": "late"},
                {"round": 1, "clan_a": {"clan_id": 3}, "clan_b": {"clan_id": 4}, "start_at": "2016-11-23T19:15:00"}
            ]
        }));

        let snapshot = normalize(&raw).unwrap();
        assert_eq!(snapshot.active_battles.len(), 1);
        assert_eq!(snapshot.active_battles[0].clan_a, 3);
    }

    #[test]
    fn it_coerces_string_ids_and_drops_garbage() {
        let raw = raw(json!({
            "territory_id": "aarhus",
            "prime_time": "19:15",
            "owner_clan_id": "192",
            "competitors": [1, "2", "not-a-clan"]
        }));

        let snapshot = normalize(&raw).unwrap();
        assert_eq!(snapshot.owner_clan_id, Some(192));
        assert_eq!(snapshot.competitors, BTreeSet::from([1, 2]));
    }
}
