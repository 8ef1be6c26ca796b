use crate::api::UpstreamApi;
use crate::clans::{resolve_or_create, update_clan_rating};
use crate::config::Config;
use crate::error::Error;
use crate::matcher::{apply_assignments, match_winners, prepare_log};
use crate::reconcile::Reconciler;
use crate::snapshot::{normalize, RawTerritory};
use crate::store::{ClanId, Store};
use crate::TrackerResult;
use chrono::{Duration, Utc};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};

// A bracket never runs longer than this past its prime time; assaults older
// than that are history and not worth polling.
const RUNNING_ASSAULT_WINDOW_HOURS: i64 = 6;

/// Drives one poll cycle: collect the territories each tracked clan cares
/// about, fetch their snapshots in per-front batches, reconcile, then match
/// winners from the clan's result log.
///
/// Every failure below a cycle is isolated: a bad snapshot, a failed batch
/// or a broken log feed costs exactly that piece of this cycle and nothing
/// else.
pub struct Poller<'a> {
    api: &'a dyn UpstreamApi,
    store: &'a dyn Store,
    config: &'a Config,
}

impl<'a> Poller<'a> {
    pub fn new(api: &'a dyn UpstreamApi, store: &'a dyn Store, config: &'a Config) -> Self {
        Poller { api, store, config }
    }

    pub async fn run_cycle(&self) -> TrackerResult {
        let cycle = crate::short_id();
        let timer = std::time::Instant::now();
        info!("[run_cycle] ({cycle}) starting poll cycle");

        match self.api.map_info().await {
            Ok(map) if map.is_frozen() => {
                info!("[run_cycle] ({cycle}) map is frozen, skipping update");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                error!("[run_cycle] ({cycle}) ❌ map state unavailable, skipping cycle - {e}");
                return Err(e);
            }
        }

        if self.config.clan_ids.is_empty() {
            warn!("[run_cycle] ({cycle}) ⚠ no clans configured, nothing to do");
            return Ok(());
        }

        for &clan_id in &self.config.clan_ids {
            if let Err(e) = self.update_clan(&cycle, clan_id).await {
                error!("[run_cycle] ({cycle}) ❌ clan {clan_id} - {e}");
            }
        }

        info!(
            "[run_cycle] ({cycle}) ✅ finished in {:.2?}",
            timer.elapsed()
        );
        Ok(())
    }

    async fn update_clan(&self, cycle: &str, clan_id: ClanId) -> TrackerResult {
        let clan = resolve_or_create(self.api, self.store, clan_id).await?;
        info!(
            "[update_clan] ({cycle}) updating clan {} ({})",
            clan_id,
            clan.tag.as_deref().unwrap_or("<no tag>")
        );

        let fronts = self.collect_clan_territories(clan_id).await?;
        let territory_count: usize = fronts.values().map(BTreeSet::len).sum();
        debug!(
            "[update_clan] ({cycle}) clan {} related territories: {}",
            clan_id, territory_count
        );

        let day_begin = self.config.day_begin()?;
        let reconciler = Reconciler::new(self.store, day_begin);

        for (front_id, territory_ids) in &fronts {
            let territory_ids: Vec<String> = territory_ids.iter().cloned().collect();

            for chunk in territory_ids.chunks(self.config.batch_size) {
                let raws = match self.api.territories(front_id, chunk).await {
                    Ok(raws) => raws,
                    Err(e) => {
                        // The whole batch is skipped; the next cycle retries.
                        error!(
                            "[update_clan] ({cycle}) ❌ batch fetch failed on front '{front_id}', skipping - {e}"
                        );
                        continue;
                    }
                };

                for raw in raws {
                    let raw = self.merge_tournament_competitors(raw).await;

                    let snapshot = match normalize(&raw) {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            error!("[update_clan] ({cycle}) ❌ rejected snapshot - {e}");
                            continue;
                        }
                    };

                    match reconciler.reconcile(&snapshot).await {
                        Ok(outcome) => {
                            if outcome.anomalous_reopen {
                                error!(
                                    "[update_clan] ({cycle}) ⚠ anomalous reopen reported for '{}'",
                                    outcome.territory_id
                                );
                            }
                            debug!(
                                "[update_clan] ({cycle}) reconciled '{}': {:?}",
                                snapshot.territory_id, outcome
                            );
                        }
                        Err(e) => {
                            // One territory failing must not abort its siblings.
                            error!(
                                "[update_clan] ({cycle}) ❌ reconcile failed for '{}' - {e}",
                                snapshot.territory_id
                            );
                        }
                    }
                }
            }
        }

        self.assign_winners(cycle, clan_id).await;
        Ok(())
    }

    /// Territories worth polling for a clan: wherever upstream says it is
    /// fighting or plans to, plus territories whose stored assault involves
    /// the clan and is still planned or recently running.
    async fn collect_clan_territories(
        &self,
        clan_id: ClanId,
    ) -> Result<BTreeMap<String, BTreeSet<String>>, Error> {
        let mut fronts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        match self.api.clan_battles(clan_id).await {
            Ok(clan_battles) => {
                for battle in clan_battles
                    .battles
                    .iter()
                    .chain(clan_battles.planned_battles.iter())
                {
                    if battle.territory_id.is_empty() {
                        continue;
                    }
                    fronts
                        .entry(battle.front_id.clone())
                        .or_default()
                        .insert(battle.territory_id.clone());
                }
            }
            Err(e) => {
                // Fall back to what the store already knows about.
                error!("[collect_clan_territories] ❌ clan battles unavailable - {e}");
            }
        }

        let now = Utc::now();
        for assault in self.store.latest_assaults().await? {
            if assault.current_owner != Some(clan_id) && !assault.participants.contains(&clan_id) {
                continue;
            }

            let prime = assault.prime_datetime();
            let planned = prime >= now;
            let running = prime + Duration::hours(RUNNING_ASSAULT_WINDOW_HOURS) >= now;
            if !planned && !running {
                continue;
            }

            let Some(territory) = self.store.territory(&assault.territory_id).await? else {
                continue;
            };
            fronts
                .entry(territory.front_id.clone())
                .or_default()
                .insert(assault.territory_id.clone());
        }

        Ok(fronts)
    }

    /// The unofficial tournament page knows pretenders the official list
    /// misses; merge them in and bank the clan cards while we are here. Any
    /// failure leaves the snapshot as fetched.
    async fn merge_tournament_competitors(&self, mut raw: RawTerritory) -> RawTerritory {
        if raw.territory_id.is_empty() {
            return raw;
        }

        let info = match self.api.tournament_info(&raw.territory_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(
                    "[merge_tournament_competitors] ⚠ no tournament info for '{}' - {e}",
                    raw.territory_id
                );
                return raw;
            }
        };

        for &rating in info.clans_info().values() {
            if let Err(e) = update_clan_rating(self.store, &raw.arena_id, rating).await {
                warn!("[merge_tournament_competitors] ⚠ {e}");
            }
        }
        if let Some(owner) = &info.owner {
            if let Err(e) = update_clan_rating(self.store, &raw.arena_id, owner).await {
                warn!("[merge_tournament_competitors] ⚠ {e}");
            }
        }

        let pretenders = info.pretender_ids();
        let known: BTreeSet<ClanId> = raw.competitors.iter().copied().collect();
        let merged: BTreeSet<ClanId> = known
            .iter()
            .copied()
            .chain(pretenders.iter().copied())
            .collect();

        if merged != known {
            debug!(
                "[merge_tournament_competitors] '{}' competitors extended {} -> {}",
                raw.territory_id,
                known.len(),
                merged.len()
            );
            raw.competitors = merged.into_iter().collect();
        }

        raw
    }

    /// Matches the clan's result log against its unresolved battles. Log
    /// trouble costs winner assignment for this cycle only.
    async fn assign_winners(&self, cycle: &str, clan_id: ClanId) {
        let raw_log = match self.api.clan_log(clan_id).await {
            Ok(raw_log) => raw_log,
            Err(e) => {
                error!("[assign_winners] ({cycle}) ❌ result log unavailable - {e}");
                return;
            }
        };

        let entries = prepare_log(&raw_log);
        if entries.is_empty() {
            return;
        }

        let battles = match self.store.unresolved_battles(clan_id).await {
            Ok(battles) => battles,
            Err(e) => {
                error!("[assign_winners] ({cycle}) ❌ {e}");
                return;
            }
        };

        let assignments = match_winners(clan_id, &battles, &entries);
        if assignments.is_empty() {
            return;
        }

        match apply_assignments(self.store, &assignments).await {
            Ok(count) => info!("[assign_winners] ({cycle}) ✅ assigned {count} winners"),
            Err(e) => error!("[assign_winners] ({cycle}) ❌ {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        RawBattleRef, RawClanBattles, RawClanInfo, RawLogEntry, RawMapInfo, RawTournamentInfo,
        LogEventType,
    };
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Canned upstream: fixed payloads, records which fronts were queried.
    #[derive(Default)]
    struct FakeApi {
        frozen: bool,
        territories: Vec<RawTerritory>,
        battles: Vec<RawBattleRef>,
        log: Vec<RawLogEntry>,
        queried_fronts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UpstreamApi for FakeApi {
        async fn map_info(&self) -> Result<RawMapInfo, Error> {
            Ok(RawMapInfo {
                state: if self.frozen { "frozen" } else { "active" }.into(),
            })
        }

        async fn territories(
            &self,
            front_id: &str,
            territory_ids: &[String],
        ) -> Result<Vec<RawTerritory>, Error> {
            self.queried_fronts.lock().push(front_id.to_string());
            Ok(self
                .territories
                .iter()
                .filter(|t| territory_ids.contains(&t.territory_id))
                .cloned()
                .collect())
        }

        async fn tournament_info(&self, _territory_id: &str) -> Result<RawTournamentInfo, Error> {
            Err(Error::fetch("tournament_info", "not in this fixture"))
        }

        async fn clan_battles(&self, _clan_id: ClanId) -> Result<RawClanBattles, Error> {
            Ok(RawClanBattles {
                battles: self.battles.clone(),
                planned_battles: Vec::new(),
            })
        }

        async fn clan_log(&self, _clan_id: ClanId) -> Result<Vec<RawLogEntry>, Error> {
            Ok(self.log.clone())
        }

        async fn clan_info(&self, clan_ids: &[ClanId]) -> Result<Vec<RawClanInfo>, Error> {
            Ok(clan_ids
                .iter()
                .map(|&id| RawClanInfo {
                    clan_id: Some(id),
                    tag: Some(format!("CLN{id}")),
                    name: Some(format!("Clan {id}")),
                })
                .collect())
        }
    }

    fn config() -> Config {
        Config {
            database_uri: "mysql://unused".into(),
            application_id: "test".into(),
            clan_ids: vec![1],
            ..Config::default()
        }
    }

    fn territory_fixture() -> RawTerritory {
        serde_json::from_value(json!({
            "territory_id": "aarhus",
            "name": "Aarhus",
            "front_id": "test_front",
            "arena_id": "10_hills",
            "prime_time": "18:15",
            "battles_start_at": "2016-11-27T18:15:00",
            "attackers": [1, 2],
            "status": "STARTED",
            "active_battles": [{
                "round": 1,
                "clan_a": {"clan_id": 1},
                "clan_b": {"clan_id": 2},
                "start_at": "2016-11-27T18:15:00"
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn it_reconciles_and_assigns_winners_in_one_cycle() {
        let api = FakeApi {
            territories: vec![territory_fixture()],
            battles: vec![RawBattleRef {
                territory_id: "aarhus".into(),
                front_id: "test_front".into(),
            }],
            log: vec![RawLogEntry {
                event: LogEventType::TournamentBattleWon,
                target_territory_id: "aarhus".into(),
                created_at: "2016-11-27T18:20:00".into(),
                winner_clan_id: Some(1),
                enemy_clan_id: Some(2),
            }],
            ..FakeApi::default()
        };
        let store = MemoryStore::new();
        let config = config();
        let poller = Poller::new(&api, &store, &config);

        poller.run_cycle().await.unwrap();

        assert_eq!(api.queried_fronts.lock().clone(), vec!["test_front".to_string()]);

        let date = chrono::NaiveDate::from_ymd_opt(2016, 11, 27).unwrap();
        let assault = store.assault("aarhus", date).await.unwrap().unwrap();
        assert_eq!(assault.participants.len(), 2);

        let battles = store.battles("aarhus", date).await.unwrap();
        assert_eq!(battles.len(), 1);
        assert_eq!(battles[0].winner, Some(1));

        // The tracked clan was enriched on the way in.
        let clan = store.clan(1).await.unwrap().unwrap();
        assert_eq!(clan.tag, Some("CLN1".into()));
    }

    #[tokio::test]
    async fn it_skips_the_cycle_when_the_map_is_frozen() {
        let api = FakeApi {
            frozen: true,
            territories: vec![territory_fixture()],
            battles: vec![RawBattleRef {
                territory_id: "aarhus".into(),
                front_id: "test_front".into(),
            }],
            ..FakeApi::default()
        };
        let store = MemoryStore::new();
        let config = config();
        let poller = Poller::new(&api, &store, &config);

        poller.run_cycle().await.unwrap();

        assert!(api.queried_fronts.lock().is_empty());
        let date = chrono::NaiveDate::from_ymd_opt(2016, 11, 27).unwrap();
        assert!(store.assault("aarhus", date).await.unwrap().is_none());
    }
}
