use crate::api::RawLogEntry;
use crate::error::Error;
use crate::snapshot::parse_instant;
use crate::store::{Battle, BattleKey, ClanId, Store};
use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::BTreeMap;

// A result is reported up to 20 minutes before the battle's recorded start
// (upstream rounds start times forward) and up to 5 minutes after it.
const EARLY_GRACE_MINUTES: i64 = 20;
const LATE_GRACE_MINUTES: i64 = 5;

/// One result-log entry in canonical form. Consumed once, matched at most
/// once to a battle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub territory_id: String,
    pub created_at: DateTime<Utc>,
    pub winner: ClanId,
    pub enemy: ClanId,
}

impl LogEntry {
    /// Canonicalizes a raw log entry. Entries missing a timestamp or a
    /// winner carry nothing matchable and are dropped.
    pub fn from_raw(raw: &RawLogEntry) -> Option<LogEntry> {
        if raw.target_territory_id.is_empty() {
            return None;
        }

        let created_at = parse_instant(&raw.created_at)?;
        let winner = raw.winner_clan_id?;

        Some(LogEntry {
            territory_id: raw.target_territory_id.clone(),
            created_at,
            winner,
            enemy: raw.enemy_clan_id.unwrap_or_default(),
        })
    }
}

/// A winner resolved for one battle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub battle: BattleKey,
    pub winner: ClanId,
}

/// Matches result-log entries to unresolved battles.
///
/// Battles must be sorted by start time and entries by timestamp; both are
/// grouped per territory and swept with two pointers. An entry matches the
/// battle when its timestamp falls inside
/// `[start - 20min, start + 5min]` (both ends inclusive); one entry resolves
/// at most one battle and one battle receives at most one winner. Entries
/// too early for the current battle are skipped as noise; a battle whose
/// window has passed is skipped and the entry is retried against the next
/// battle.
pub fn match_winners(clan_id: ClanId, battles: &[Battle], entries: &[LogEntry]) -> Vec<Assignment> {
    let mut by_territory: BTreeMap<&str, (Vec<&Battle>, Vec<&LogEntry>)> = BTreeMap::new();

    for battle in battles {
        by_territory
            .entry(battle.territory_id.as_str())
            .or_default()
            .0
            .push(battle);
    }

    for entry in entries {
        // Entries for territories without unresolved battles have nothing to
        // resolve.
        if let Some(group) = by_territory.get_mut(entry.territory_id.as_str()) {
            group.1.push(entry);
        }
    }

    let mut assignments = Vec::new();

    for (territory_id, (battles, entries)) in by_territory {
        let mut battle_index = 0;
        let mut entry_index = 0;

        while battle_index < battles.len() && entry_index < entries.len() {
            let battle = battles[battle_index];
            let entry = entries[entry_index];

            let window_open = battle.start_at - Duration::minutes(EARLY_GRACE_MINUTES);
            let window_close = battle.start_at + Duration::minutes(LATE_GRACE_MINUTES);

            if entry.created_at < window_open {
                // Implausibly early for this battle; noise, or a result for
                // a battle that is no longer unresolved.
                debug!(
                    "[match_winners] clan {}: dropping early log entry at {} for '{}'",
                    clan_id, entry.created_at, territory_id
                );
                entry_index += 1;
                continue;
            }

            if entry.created_at <= window_close {
                assignments.push(Assignment {
                    battle: battle.key(),
                    winner: entry.winner,
                });
                battle_index += 1;
                entry_index += 1;
                continue;
            }

            // The entry is past this battle's window; the battle stays
            // unresolved and the entry is retried against the next one.
            battle_index += 1;
        }
    }

    assignments
}

/// Writes matched winners through the store, creating clan stubs for
/// winners never seen in a snapshot.
pub async fn apply_assignments(
    store: &dyn Store,
    assignments: &[Assignment],
) -> Result<usize, Error> {
    for assignment in assignments {
        store.get_or_create_clan(assignment.winner).await?;
        store
            .set_battle_winner(&assignment.battle, assignment.winner)
            .await?;

        debug!(
            "[apply_assignments] battle '{}' round {} won by {}",
            assignment.battle.territory_id, assignment.battle.round, assignment.winner
        );
    }

    Ok(assignments.len())
}

/// Filters, canonicalizes and orders a polled result log for matching.
pub fn prepare_log(raw_entries: &[RawLogEntry]) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = raw_entries
        .iter()
        .filter(|raw| raw.event.is_result())
        .filter_map(LogEntry::from_raw)
        .collect();

    entries.sort_by_key(|entry| entry.created_at);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LogEventType;
    use chrono::{NaiveDate, NaiveTime};
    use pretty_assertions::assert_eq;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn battle(territory_id: &str, round: i32, start_at: DateTime<Utc>) -> Battle {
        Battle {
            territory_id: territory_id.to_string(),
            date: NaiveDate::from_ymd_opt(2016, 11, 27).unwrap(),
            round,
            clan_a: 1,
            clan_b: 2,
            start_at,
            arena_id: "test_arena".into(),
            winner: None,
        }
    }

    fn entry(territory_id: &str, created_at: DateTime<Utc>, winner: ClanId) -> LogEntry {
        LogEntry {
            territory_id: territory_id.to_string(),
            created_at,
            winner,
            enemy: 99,
        }
    }

    #[test]
    fn it_matches_inside_the_grace_window() {
        let start = at("2016-11-27T18:15:00Z");
        let battles = vec![battle("aarhus", 1, start)];

        for created_at in [
            start - Duration::minutes(20),
            start,
            start + Duration::minutes(5),
        ] {
            let entries = vec![entry("aarhus", created_at, 1)];
            let assignments = match_winners(1, &battles, &entries);
            assert_eq!(assignments.len(), 1, "expected a match at {created_at}");
            assert_eq!(assignments[0].winner, 1);
        }
    }

    #[test]
    fn it_rejects_entries_a_second_outside_the_window() {
        let start = at("2016-11-27T18:15:00Z");
        let battles = vec![battle("aarhus", 1, start)];

        for created_at in [
            start - Duration::minutes(20) - Duration::seconds(1),
            start + Duration::minutes(5) + Duration::seconds(1),
        ] {
            let entries = vec![entry("aarhus", created_at, 1)];
            assert!(
                match_winners(1, &battles, &entries).is_empty(),
                "expected no match at {created_at}"
            );
        }
    }

    #[test]
    fn it_resolves_each_battle_at_most_once() {
        let start = at("2016-11-27T18:15:00Z");
        let battles = vec![battle("aarhus", 1, start)];
        let entries = vec![
            entry("aarhus", start + Duration::minutes(1), 1),
            entry("aarhus", start + Duration::minutes(2), 2),
        ];

        let assignments = match_winners(1, &battles, &entries);
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].winner, 1);
    }

    #[test]
    fn it_sweeps_rounds_in_order() {
        let first = at("2016-11-27T18:15:00Z");
        let second = at("2016-11-27T18:45:00Z");
        let battles = vec![battle("aarhus", 1, first), battle("aarhus", 2, second)];
        let entries = vec![
            entry("aarhus", first + Duration::minutes(2), 1),
            entry("aarhus", second + Duration::minutes(2), 1),
        ];

        let assignments = match_winners(1, &battles, &entries);
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].battle.round, 1);
        assert_eq!(assignments[1].battle.round, 2);
    }

    #[test]
    fn it_leaves_a_late_entry_for_the_next_battle() {
        let first = at("2016-11-27T18:15:00Z");
        let second = at("2016-11-27T18:45:00Z");
        let battles = vec![battle("aarhus", 1, first), battle("aarhus", 2, second)];

        // Only the second round's result ever arrived.
        let entries = vec![entry("aarhus", second + Duration::minutes(1), 1)];

        let assignments = match_winners(1, &battles, &entries);
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].battle.round, 2);
    }

    #[test]
    fn it_keeps_territories_independent() {
        let start = at("2016-11-27T18:15:00Z");
        let battles = vec![battle("aarhus", 1, start), battle("herning", 1, start)];
        let entries = vec![
            entry("aarhus", start, 1),
            entry("herning", start, 2),
            entry("odense", start, 3),
        ];

        let assignments = match_winners(1, &battles, &entries);
        assert_eq!(assignments.len(), 2);
    }

    #[test]
    fn it_prepares_a_raw_log_for_matching() {
        let raw = vec![
            RawLogEntry {
                event: LogEventType::TerritoryCaptured,
                target_territory_id: "aarhus".into(),
                created_at: "2016-11-27T19:00:00".into(),
                winner_clan_id: Some(1),
                enemy_clan_id: Some(2),
            },
            RawLogEntry {
                event: LogEventType::Unknown,
                target_territory_id: "aarhus".into(),
                created_at: "2016-11-27T18:00:00".into(),
                winner_clan_id: Some(1),
                enemy_clan_id: Some(2),
            },
            RawLogEntry {
                event: LogEventType::TournamentBattleWon,
                target_territory_id: "aarhus".into(),
                created_at: "2016-11-27T18:30:00".into(),
                winner_clan_id: Some(3),
                enemy_clan_id: None,
            },
        ];

        let entries = prepare_log(&raw);
        assert_eq!(entries.len(), 2);
        // Sorted by timestamp, unknown event types dropped.
        assert_eq!(entries[0].winner, 3);
        assert_eq!(entries[1].winner, 1);
    }

    #[tokio::test]
    async fn it_applies_assignments_through_the_store() {
        use crate::store::{Assault, MemoryStore};

        let store = MemoryStore::new();
        let date = NaiveDate::from_ymd_opt(2016, 11, 27).unwrap();
        store
            .update_or_create_assault(&Assault {
                territory_id: "aarhus".into(),
                date,
                prime_time: NaiveTime::from_hms_opt(18, 15, 0).unwrap(),
                arena_id: "test_arena".into(),
                ..Assault::default()
            })
            .await
            .unwrap();

        let fought = battle("aarhus", 1, at("2016-11-27T18:15:00Z"));
        store.upsert_battle(&fought).await.unwrap();

        let assignments = vec![Assignment {
            battle: fought.key(),
            winner: 7,
        }];
        assert_eq!(apply_assignments(&store, &assignments).await.unwrap(), 1);

        let battles = store.battles("aarhus", date).await.unwrap();
        assert_eq!(battles[0].winner, Some(7));
        // The winner exists as a clan stub even though no snapshot named it.
        assert!(store.clan(7).await.unwrap().is_some());
    }
}
