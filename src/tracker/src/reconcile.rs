use crate::day::battle_day;
use crate::error::Error;
use crate::snapshot::TerritorySnapshot;
use crate::store::{Assault, Battle, ClanId, Status, Store, Territory};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use log::{debug, error, warn};
use std::collections::BTreeSet;

/// What one reconciliation pass did, for the orchestrator's logs and for
/// tests. Warning conditions are carried here as well as logged: the log
/// file is the operator channel, the flags are the machine-readable one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub territory_id: String,
    pub date: Option<NaiveDate>,
    /// A new assault record was created this pass.
    pub created: bool,
    /// The assault was deleted because the contest fizzled before prime time.
    pub deleted: bool,
    /// New battle records created (upserts that only refreshed a start time
    /// are not counted).
    pub battles_created: usize,
    /// Size of the participant set after this pass.
    pub participants: usize,
    /// The snapshot tried to reopen a day that already closed; the assault
    /// was left untouched.
    pub anomalous_reopen: bool,
    /// The participant set emptied after prime time; the assault and its
    /// battle history were retained.
    pub orphaned: bool,
}

impl Outcome {
    fn new(territory_id: &str) -> Self {
        Outcome {
            territory_id: territory_id.to_string(),
            ..Outcome::default()
        }
    }
}

/// Merges normalized snapshots into the persisted assault projection.
///
/// Every step is an idempotent upsert: reconciling the identical snapshot
/// twice leaves the store unchanged, and a failed call can simply be retried
/// on the next poll cycle. Concurrent reconciliation of different
/// territories is safe; the same territory must be reconciled by a single
/// writer at a time.
pub struct Reconciler<'a> {
    store: &'a dyn Store,
    day_begin: NaiveTime,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn Store, day_begin: NaiveTime) -> Self {
        Reconciler { store, day_begin }
    }

    pub async fn reconcile(&self, snapshot: &TerritorySnapshot) -> Result<Outcome, Error> {
        self.reconcile_at(snapshot, Utc::now()).await
    }

    pub async fn reconcile_at(
        &self,
        snapshot: &TerritorySnapshot,
        now: DateTime<Utc>,
    ) -> Result<Outcome, Error> {
        let territory_id = &snapshot.territory_id;
        let mut outcome = Outcome::new(territory_id);

        // Territory metadata always reflects the latest snapshot.
        if let Some(owner) = snapshot.owner_clan_id {
            self.store.get_or_create_clan(owner).await?;
        }
        self.store
            .upsert_territory(&Territory {
                territory_id: territory_id.clone(),
                front_id: snapshot.front_id.clone(),
                name: snapshot.name.clone(),
                owner_clan_id: snapshot.owner_clan_id,
                arena_id: snapshot.arena_id.clone(),
                arena_name: snapshot.arena_name.clone(),
                prime_time: snapshot.prime_time,
                server: snapshot.server.clone(),
            })
            .await?;

        let Some(battles_start_at) = snapshot.battles_start_at else {
            debug!(
                "[reconcile] no battle start reported for '{}', nothing to reconcile",
                territory_id
            );
            return Ok(outcome);
        };

        // Candidate participants: competitors, attackers, and whoever is
        // already fighting. Active battles are included because upstream
        // empties the competitor/attacker lists once a bracket is STARTED.
        let mut candidates: BTreeSet<ClanId> = snapshot
            .competitors
            .iter()
            .chain(snapshot.attackers.iter())
            .copied()
            .collect();
        for battle in &snapshot.active_battles {
            candidates.insert(battle.clan_a);
            candidates.insert(battle.clan_b);
        }

        let date = battle_day(battles_start_at, self.day_begin);
        outcome.date = Some(date);

        let existing = self.store.assault(territory_id, date).await?;
        if existing.is_none() && candidates.is_empty() {
            return Ok(outcome);
        }

        // A closed day is never reopened. Upstream reporting a later battle
        // start against a finished assault means the day boundary drifted or
        // the snapshot is stale; either way, touching the record would
        // resurrect it.
        if let Some(assault) = &existing {
            if assault.status == Some(Status::Finished)
                && snapshot.status == Some(Status::Finished)
                && battles_start_at > assault.prime_datetime()
            {
                error!(
                    "[reconcile] ⚠ snapshot for '{}' would reopen the finished assault of {}, \
                     skipping update (battles_start_at: {}, prime: {})",
                    territory_id,
                    assault.date,
                    battles_start_at,
                    assault.prime_datetime()
                );
                outcome.anomalous_reopen = true;
                return Ok(outcome);
            }
        }

        let created = self
            .store
            .update_or_create_assault(&Assault {
                territory_id: territory_id.clone(),
                date,
                current_owner: snapshot.owner_clan_id,
                prime_time: snapshot.prime_time,
                arena_id: snapshot.arena_id.clone(),
                round_number: snapshot.round_number,
                landing_type: snapshot.landing_type.clone(),
                status: snapshot.status,
                participants: BTreeSet::new(),
            })
            .await?;
        outcome.created = created;

        if created {
            debug!(
                "[reconcile] created assault for '{}' {{current_owner: {:?}, date: {}, attackers_count: {}}}",
                territory_id,
                snapshot.owner_clan_id,
                date,
                snapshot.attackers.len()
            );
        }

        // At most one assault per territory may be open: a new bracket day
        // cannot begin while the previous one is still running.
        if snapshot.status == Some(Status::Started) {
            for other in self.store.assaults_for_territory(territory_id).await? {
                if other.date != date && other.status == Some(Status::Started) {
                    warn!(
                        "[reconcile] forcing assault '{}'@{} to FINISHED, a new bracket day has started",
                        territory_id, other.date
                    );
                    self.store
                        .set_status(territory_id, other.date, Status::Finished)
                        .await?;
                }
            }
        }

        for active in &snapshot.active_battles {
            self.store.get_or_create_clan(active.clan_a).await?;
            self.store.get_or_create_clan(active.clan_b).await?;

            let battle = Battle {
                territory_id: territory_id.clone(),
                date,
                round: active.round,
                clan_a: active.clan_a,
                clan_b: active.clan_b,
                start_at: active.start_at,
                arena_id: snapshot.arena_id.clone(),
                winner: None,
            };

            if self.store.upsert_battle(&battle).await? {
                outcome.battles_created += 1;
                debug!(
                    "[reconcile] created battle for '{}' {{round: {}, clan_a: {}, clan_b: {}}}",
                    territory_id, active.round, active.clan_a, active.clan_b
                );
            }
        }

        for &clan_id in &candidates {
            self.store.get_or_create_clan(clan_id).await?;
        }

        // The defending owner holds the final-round slot, never a
        // participant row. Removed only after the battle upserts above: an
        // owner can legitimately fight in earlier rounds of the same bracket.
        if let Some(owner) = snapshot.owner_clan_id {
            candidates.remove(&owner);
        }

        let stored = existing
            .map(|assault| assault.participants)
            .unwrap_or_default();

        if stored != candidates {
            self.store
                .set_participants(territory_id, date, &candidates)
                .await?;

            if candidates.is_empty() {
                debug!(
                    "[reconcile] no more clans assaulting '{}', cleared participants",
                    territory_id
                );

                let prime = date.and_time(snapshot.prime_time).and_utc();
                if prime > now {
                    self.store.delete_assault(territory_id, date).await?;
                    outcome.deleted = true;
                    debug!("[reconcile] removed assault for '{}'", territory_id);
                } else {
                    warn!(
                        "[reconcile] ⚠ no clans left in assault '{}' after its prime time",
                        territory_id
                    );
                    outcome.orphaned = true;
                }
            } else {
                debug!(
                    "[reconcile] set {} participants on '{}': {:?}",
                    candidates.len(),
                    territory_id,
                    candidates
                );
            }
        }

        outcome.participants = candidates.len();
        Ok(outcome)
    }
}
