use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type ClanId = u64;

/// A participant identity. Created as a stub the first time its id shows up
/// in any snapshot or log entry, enriched later, never deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clan {
    pub id: ClanId,
    pub tag: Option<String>,
    pub title: Option<String>,
    pub elo_6: Option<i32>,
    pub elo_8: Option<i32>,
    pub elo_10: Option<i32>,
}

impl Clan {
    pub fn stub(id: ClanId) -> Self {
        Clan {
            id,
            ..Clan::default()
        }
    }

    /// A stub has never been enriched with upstream clan info.
    pub fn is_stub(&self) -> bool {
        self.tag.is_none() && self.title.is_none()
    }
}

/// Per-arena performance numbers for a clan, shown next to it in the
/// projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClanArenaStat {
    pub clan_id: ClanId,
    pub arena_id: String,
    pub wins_percent: f64,
    pub battles_count: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Front {
    pub front_id: String,
    pub max_vehicle_level: i32,
}

/// A contested map region. Metadata always reflects the latest snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Territory {
    pub territory_id: String,
    pub front_id: String,
    pub name: String,
    pub owner_clan_id: Option<ClanId>,
    pub arena_id: String,
    pub arena_name: String,
    /// Time of day the bracket's first round begins, UTC.
    pub prime_time: NaiveTime,
    pub server: String,
}

/// Upstream-reported assault status. Not locally derived; the only local
/// rule is that FINISHED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Started,
    Finished,
}

impl Status {
    pub fn parse(value: &str) -> Option<Status> {
        match value {
            "STARTED" => Some(Status::Started),
            "FINISHED" => Some(Status::Finished),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Started => "STARTED",
            Status::Finished => "FINISHED",
        }
    }
}

/// One day's contest over one territory. At most one assault exists per
/// (territory, battle day).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assault {
    pub territory_id: String,
    pub date: NaiveDate,
    pub current_owner: Option<ClanId>,
    pub prime_time: NaiveTime,
    pub arena_id: String,
    /// As reported by upstream; stale or absent before prime time.
    pub round_number: Option<i32>,
    pub landing_type: Option<String>,
    pub status: Option<Status>,
    /// Clans currently believed to be contesting. The defending owner is
    /// not a participant; it holds the final-round slot instead.
    pub participants: BTreeSet<ClanId>,
}

impl Assault {
    pub fn prime_datetime(&self) -> DateTime<Utc> {
        self.date.and_time(self.prime_time).and_utc()
    }
}

/// One scheduled or fought match within an assault's bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Battle {
    pub territory_id: String,
    pub date: NaiveDate,
    pub round: i32,
    pub clan_a: ClanId,
    pub clan_b: ClanId,
    /// Reported start; upstream shifts this between polls and the latest
    /// value wins without creating a duplicate record.
    pub start_at: DateTime<Utc>,
    pub arena_id: String,
    /// Set only by the winner log matcher, never cleared once set.
    pub winner: Option<ClanId>,
}

impl Battle {
    pub fn key(&self) -> BattleKey {
        BattleKey {
            territory_id: self.territory_id.clone(),
            date: self.date,
            round: self.round,
            clan_a: self.clan_a,
            clan_b: self.clan_b,
        }
    }
}

/// The idempotency key for battle upserts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BattleKey {
    pub territory_id: String,
    pub date: NaiveDate,
    pub round: i32,
    pub clan_a: ClanId,
    pub clan_b: ClanId,
}

/// Key-addressed record store for the §3 entities, with get-or-create and
/// update-or-create primitives. The store enforces the uniqueness
/// invariants: one assault per (territory, date), one battle per
/// (territory, date, round, clan_a, clan_b).
#[async_trait]
pub trait Store: Send + Sync {
    async fn clan(&self, id: ClanId) -> Result<Option<Clan>, Error>;

    /// Returns the clan, creating a stub record if the id is unseen.
    async fn get_or_create_clan(&self, id: ClanId) -> Result<Clan, Error>;

    /// Writes the record as given (last write wins; callers merge fields).
    async fn update_clan(&self, clan: &Clan) -> Result<(), Error>;

    async fn arena_stat(
        &self,
        clan_id: ClanId,
        arena_id: &str,
    ) -> Result<Option<ClanArenaStat>, Error>;

    async fn upsert_arena_stat(&self, stat: &ClanArenaStat) -> Result<(), Error>;

    async fn front(&self, front_id: &str) -> Result<Option<Front>, Error>;

    async fn upsert_front(&self, front: &Front) -> Result<(), Error>;

    async fn territory(&self, territory_id: &str) -> Result<Option<Territory>, Error>;

    async fn upsert_territory(&self, territory: &Territory) -> Result<(), Error>;

    async fn assault(
        &self,
        territory_id: &str,
        date: NaiveDate,
    ) -> Result<Option<Assault>, Error>;

    /// All assaults recorded for a territory, oldest first.
    async fn assaults_for_territory(&self, territory_id: &str) -> Result<Vec<Assault>, Error>;

    /// The most recent assault of every territory.
    async fn latest_assaults(&self) -> Result<Vec<Assault>, Error>;

    /// Upserts the scalar fields of an assault; the participant set is
    /// managed separately through [`Store::set_participants`]. Returns true
    /// when the record was created.
    async fn update_or_create_assault(&self, assault: &Assault) -> Result<bool, Error>;

    /// Replaces the participant set atomically (clear + re-add).
    async fn set_participants(
        &self,
        territory_id: &str,
        date: NaiveDate,
        clans: &BTreeSet<ClanId>,
    ) -> Result<(), Error>;

    async fn set_status(
        &self,
        territory_id: &str,
        date: NaiveDate,
        status: Status,
    ) -> Result<(), Error>;

    /// Deletes the assault and its battles. Only legal for a contest that
    /// fizzled before its prime time; the reconciler enforces that rule.
    async fn delete_assault(&self, territory_id: &str, date: NaiveDate) -> Result<(), Error>;

    /// Upserts a battle by its idempotency key, overwriting the stored
    /// start time and arena. The winner field is never touched. Returns
    /// true when the record was created.
    async fn upsert_battle(&self, battle: &Battle) -> Result<bool, Error>;

    /// Battles of one assault ordered by (round, start_at).
    async fn battles(&self, territory_id: &str, date: NaiveDate) -> Result<Vec<Battle>, Error>;

    /// Battles involving the clan that have no winner yet, ordered by
    /// start_at.
    async fn unresolved_battles(&self, clan_id: ClanId) -> Result<Vec<Battle>, Error>;

    /// Records a winner. A winner already present is kept; this write is
    /// once-only.
    async fn set_battle_winner(&self, key: &BattleKey, winner: ClanId) -> Result<(), Error>;
}

type AssaultKey = (String, NaiveDate);
type BattleMapKey = (String, NaiveDate, i32, ClanId, ClanId);

#[derive(Default)]
struct Tables {
    clans: BTreeMap<ClanId, Clan>,
    arena_stats: BTreeMap<(ClanId, String), ClanArenaStat>,
    fronts: BTreeMap<String, Front>,
    territories: BTreeMap<String, Territory>,
    assaults: BTreeMap<AssaultKey, Assault>,
    battles: BTreeMap<BattleMapKey, Battle>,
}

/// In-memory store. Reference semantics for the trait and the backing store
/// for unit tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn battle_map_key(battle: &Battle) -> BattleMapKey {
    (
        battle.territory_id.clone(),
        battle.date,
        battle.round,
        battle.clan_a,
        battle.clan_b,
    )
}

#[async_trait]
impl Store for MemoryStore {
    async fn clan(&self, id: ClanId) -> Result<Option<Clan>, Error> {
        Ok(self.inner.read().clans.get(&id).cloned())
    }

    async fn get_or_create_clan(&self, id: ClanId) -> Result<Clan, Error> {
        let mut tables = self.inner.write();
        Ok(tables
            .clans
            .entry(id)
            .or_insert_with(|| Clan::stub(id))
            .clone())
    }

    async fn update_clan(&self, clan: &Clan) -> Result<(), Error> {
        self.inner.write().clans.insert(clan.id, clan.clone());
        Ok(())
    }

    async fn arena_stat(
        &self,
        clan_id: ClanId,
        arena_id: &str,
    ) -> Result<Option<ClanArenaStat>, Error> {
        Ok(self
            .inner
            .read()
            .arena_stats
            .get(&(clan_id, arena_id.to_string()))
            .cloned())
    }

    async fn upsert_arena_stat(&self, stat: &ClanArenaStat) -> Result<(), Error> {
        self.inner
            .write()
            .arena_stats
            .insert((stat.clan_id, stat.arena_id.clone()), stat.clone());
        Ok(())
    }

    async fn front(&self, front_id: &str) -> Result<Option<Front>, Error> {
        Ok(self.inner.read().fronts.get(front_id).cloned())
    }

    async fn upsert_front(&self, front: &Front) -> Result<(), Error> {
        self.inner
            .write()
            .fronts
            .insert(front.front_id.clone(), front.clone());
        Ok(())
    }

    async fn territory(&self, territory_id: &str) -> Result<Option<Territory>, Error> {
        Ok(self.inner.read().territories.get(territory_id).cloned())
    }

    async fn upsert_territory(&self, territory: &Territory) -> Result<(), Error> {
        self.inner
            .write()
            .territories
            .insert(territory.territory_id.clone(), territory.clone());
        Ok(())
    }

    async fn assault(
        &self,
        territory_id: &str,
        date: NaiveDate,
    ) -> Result<Option<Assault>, Error> {
        Ok(self
            .inner
            .read()
            .assaults
            .get(&(territory_id.to_string(), date))
            .cloned())
    }

    async fn assaults_for_territory(&self, territory_id: &str) -> Result<Vec<Assault>, Error> {
        Ok(self
            .inner
            .read()
            .assaults
            .values()
            .filter(|a| a.territory_id == territory_id)
            .cloned()
            .collect())
    }

    async fn latest_assaults(&self) -> Result<Vec<Assault>, Error> {
        let tables = self.inner.read();
        let mut latest: BTreeMap<&str, &Assault> = BTreeMap::new();

        for assault in tables.assaults.values() {
            latest
                .entry(assault.territory_id.as_str())
                .and_modify(|current| {
                    if assault.date > current.date {
                        *current = assault;
                    }
                })
                .or_insert(assault);
        }

        Ok(latest.into_values().cloned().collect())
    }

    async fn update_or_create_assault(&self, assault: &Assault) -> Result<bool, Error> {
        let mut tables = self.inner.write();
        let key = (assault.territory_id.clone(), assault.date);

        match tables.assaults.get_mut(&key) {
            Some(existing) => {
                let participants = std::mem::take(&mut existing.participants);
                *existing = assault.clone();
                existing.participants = participants;
                Ok(false)
            }
            None => {
                let mut created = assault.clone();
                created.participants = BTreeSet::new();
                tables.assaults.insert(key, created);
                Ok(true)
            }
        }
    }

    async fn set_participants(
        &self,
        territory_id: &str,
        date: NaiveDate,
        clans: &BTreeSet<ClanId>,
    ) -> Result<(), Error> {
        let mut tables = self.inner.write();
        let key = (territory_id.to_string(), date);

        match tables.assaults.get_mut(&key) {
            Some(assault) => {
                assault.participants = clans.clone();
                Ok(())
            }
            None => Err(Error::Database(format!(
                "no assault for territory {territory_id:?} on {date}"
            ))),
        }
    }

    async fn set_status(
        &self,
        territory_id: &str,
        date: NaiveDate,
        status: Status,
    ) -> Result<(), Error> {
        let mut tables = self.inner.write();
        let key = (territory_id.to_string(), date);

        match tables.assaults.get_mut(&key) {
            Some(assault) => {
                assault.status = Some(status);
                Ok(())
            }
            None => Err(Error::Database(format!(
                "no assault for territory {territory_id:?} on {date}"
            ))),
        }
    }

    async fn delete_assault(&self, territory_id: &str, date: NaiveDate) -> Result<(), Error> {
        let mut tables = self.inner.write();
        tables
            .assaults
            .remove(&(territory_id.to_string(), date));
        tables
            .battles
            .retain(|_, b| !(b.territory_id == territory_id && b.date == date));
        Ok(())
    }

    async fn upsert_battle(&self, battle: &Battle) -> Result<bool, Error> {
        let mut tables = self.inner.write();

        match tables.battles.get_mut(&battle_map_key(battle)) {
            Some(existing) => {
                existing.start_at = battle.start_at;
                existing.arena_id = battle.arena_id.clone();
                Ok(false)
            }
            None => {
                let mut created = battle.clone();
                created.winner = None;
                tables.battles.insert(battle_map_key(battle), created);
                Ok(true)
            }
        }
    }

    async fn battles(&self, territory_id: &str, date: NaiveDate) -> Result<Vec<Battle>, Error> {
        let mut battles: Vec<Battle> = self
            .inner
            .read()
            .battles
            .values()
            .filter(|b| b.territory_id == territory_id && b.date == date)
            .cloned()
            .collect();

        battles.sort_by(|a, b| (a.round, a.start_at).cmp(&(b.round, b.start_at)));
        Ok(battles)
    }

    async fn unresolved_battles(&self, clan_id: ClanId) -> Result<Vec<Battle>, Error> {
        let mut battles: Vec<Battle> = self
            .inner
            .read()
            .battles
            .values()
            .filter(|b| b.winner.is_none() && (b.clan_a == clan_id || b.clan_b == clan_id))
            .cloned()
            .collect();

        battles.sort_by(|a, b| (a.start_at, a.round).cmp(&(b.start_at, b.round)));
        Ok(battles)
    }

    async fn set_battle_winner(&self, key: &BattleKey, winner: ClanId) -> Result<(), Error> {
        let mut tables = self.inner.write();
        let map_key = (
            key.territory_id.clone(),
            key.date,
            key.round,
            key.clan_a,
            key.clan_b,
        );

        match tables.battles.get_mut(&map_key) {
            Some(battle) => {
                if battle.winner.is_none() {
                    battle.winner = Some(winner);
                }
                Ok(())
            }
            None => Err(Error::Database(format!(
                "no battle for territory {:?} on {} round {} ({} vs {})",
                key.territory_id, key.date, key.round, key.clan_a, key.clan_b
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn assault(territory_id: &str, date: NaiveDate) -> Assault {
        Assault {
            territory_id: territory_id.to_string(),
            date,
            prime_time: NaiveTime::from_hms_opt(18, 15, 0).unwrap(),
            arena_id: "10_hills".into(),
            ..Assault::default()
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2016, 11, d).unwrap()
    }

    #[tokio::test]
    async fn it_preserves_participants_across_scalar_updates() {
        let store = MemoryStore::new();
        let a = assault("aarhus", date(27));

        assert!(store.update_or_create_assault(&a).await.unwrap());
        store
            .set_participants("aarhus", date(27), &BTreeSet::from([1, 2]))
            .await
            .unwrap();

        let mut updated = a.clone();
        updated.round_number = Some(2);
        assert!(!store.update_or_create_assault(&updated).await.unwrap());

        let stored = store.assault("aarhus", date(27)).await.unwrap().unwrap();
        assert_eq!(stored.round_number, Some(2));
        assert_eq!(stored.participants, BTreeSet::from([1, 2]));
    }

    #[tokio::test]
    async fn it_keeps_a_recorded_winner_on_repeated_writes() {
        let store = MemoryStore::new();
        store.update_or_create_assault(&assault("aarhus", date(27))).await.unwrap();

        let battle = Battle {
            territory_id: "aarhus".into(),
            date: date(27),
            round: 1,
            clan_a: 1,
            clan_b: 2,
            start_at: date(27).and_hms_opt(18, 15, 0).unwrap().and_utc(),
            arena_id: "10_hills".into(),
            winner: None,
        };
        store.upsert_battle(&battle).await.unwrap();

        store.set_battle_winner(&battle.key(), 1).await.unwrap();
        store.set_battle_winner(&battle.key(), 2).await.unwrap();

        let stored = store.battles("aarhus", date(27)).await.unwrap();
        assert_eq!(stored[0].winner, Some(1));
    }

    #[tokio::test]
    async fn it_never_touches_the_winner_through_battle_upserts() {
        let store = MemoryStore::new();
        store.update_or_create_assault(&assault("aarhus", date(27))).await.unwrap();

        let mut battle = Battle {
            territory_id: "aarhus".into(),
            date: date(27),
            round: 1,
            clan_a: 1,
            clan_b: 2,
            start_at: date(27).and_hms_opt(18, 15, 0).unwrap().and_utc(),
            arena_id: "10_hills".into(),
            winner: None,
        };
        store.upsert_battle(&battle).await.unwrap();
        store.set_battle_winner(&battle.key(), 1).await.unwrap();

        battle.start_at = date(27).and_hms_opt(18, 20, 0).unwrap().and_utc();
        assert!(!store.upsert_battle(&battle).await.unwrap());

        let stored = store.battles("aarhus", date(27)).await.unwrap();
        assert_eq!(stored[0].winner, Some(1));
        assert_eq!(
            stored[0].start_at,
            date(27).and_hms_opt(18, 20, 0).unwrap().and_utc()
        );
    }

    #[tokio::test]
    async fn it_reports_the_latest_assault_per_territory() {
        let store = MemoryStore::new();
        store.update_or_create_assault(&assault("aarhus", date(26))).await.unwrap();
        store.update_or_create_assault(&assault("aarhus", date(27))).await.unwrap();
        store.update_or_create_assault(&assault("herning", date(25))).await.unwrap();

        let latest = store.latest_assaults().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].territory_id, "aarhus");
        assert_eq!(latest[0].date, date(27));
    }
}
