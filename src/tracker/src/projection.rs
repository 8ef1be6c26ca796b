use crate::error::Error;
use crate::schedule::{planned_times, round_title};
use crate::store::{Assault, Battle, Clan, ClanId, Status, Store};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// One displayed bracket round: the reported battle when upstream sent one,
/// otherwise a planned placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RoundView {
    round: i32,
    /// The reported battle, if any.
    real: Option<Battle>,
    /// The pairing to display. A placeholder has one only for the final
    /// slot, where the defending owner awaits the bracket winner.
    pair: Option<(ClanId, ClanId)>,
    /// Recorded winner, or the implied one: a missing battle in an
    /// already-passed round of a running bracket means the clan advanced.
    winner: Option<ClanId>,
}

fn round_views(
    assault: &Assault,
    clan_id: ClanId,
    max_rounds: usize,
    battles: Vec<Battle>,
) -> Vec<RoundView> {
    let mut by_round: BTreeMap<i32, Battle> = battles
        .into_iter()
        .filter(|battle| battle.clan_a == clan_id || battle.clan_b == clan_id)
        .map(|battle| (battle.round, battle))
        .collect();

    (1..=max_rounds as i32)
        .map(|round| match by_round.remove(&round) {
            Some(battle) => RoundView {
                round,
                pair: Some((battle.clan_a, battle.clan_b)),
                winner: battle.winner,
                real: Some(battle),
            },
            None => {
                let implied = round <= assault.round_number.unwrap_or(0)
                    && assault.status == Some(Status::Started);
                let pair = if round as usize == max_rounds {
                    assault.current_owner.map(|owner| (owner, clan_id))
                } else {
                    None
                };

                RoundView {
                    round,
                    real: None,
                    pair,
                    winner: implied.then_some(clan_id),
                }
            }
        })
        .collect()
}

/// Renders one assault the way a clan sees it: `"defence"` when the clan
/// owns the territory, `"attack"` otherwise. With `current_only` set, rounds
/// that already closed are dropped unless the bracket has not begun yet.
pub async fn assault_clan_json(
    store: &dyn Store,
    assault: &Assault,
    clan_id: ClanId,
    now: DateTime<Utc>,
    current_only: bool,
) -> Result<Value, Error> {
    let territory = store.territory(&assault.territory_id).await?.ok_or_else(|| {
        Error::Database(format!(
            "assault for unknown territory {:?}",
            assault.territory_id
        ))
    })?;
    let front = store.front(&territory.front_id).await?;

    let planned = planned_times(
        assault.prime_datetime(),
        assault.participants.len(),
        assault.round_number,
        now,
        assault.current_owner.is_some(),
    );
    let max_rounds = planned.len();

    let battles = store.battles(&assault.territory_id, assault.date).await?;
    let mut views = round_views(assault, clan_id, max_rounds, battles);

    if current_only {
        views.retain(|view| {
            (view.round >= assault.round_number.unwrap_or(1)
                && assault.status != Some(Status::Finished))
                || assault.prime_datetime() > now
        });
    }

    let mode = if assault.current_owner == Some(clan_id) {
        // The owner only ever plays the final slot.
        views = views.pop().into_iter().collect();
        "defence"
    } else {
        "attack"
    };

    let mut rows = Vec::with_capacity(views.len());
    for view in &views {
        rows.push(battle_json(store, assault, view, max_rounds).await?);
    }

    let mut clans = Map::new();
    for &participant in &assault.participants {
        clans.insert(
            participant.to_string(),
            clan_with_arena_json(store, participant, &assault.arena_id).await?,
        );
    }

    Ok(json!({
        "mode": mode,
        "territory_info": {
            "territory_id": territory.territory_id,
            "name": territory.name,
            "owner": match territory.owner_clan_id {
                Some(owner) => clan_json(store, owner).await?,
                None => Value::Null,
            },
            "arena_id": territory.arena_id,
            "arena_name": territory.arena_name,
            "prime_time": territory.prime_time.format("%H:%M").to_string(),
            "server": territory.server,
            "max_vehicle_level": front.map(|f| json!(f.max_vehicle_level)).unwrap_or(Value::Null),
        },
        "prime_time": assault.prime_datetime().to_rfc3339(),
        "clans": clans,
        "battles": rows,
    }))
}

async fn battle_json(
    store: &dyn Store,
    assault: &Assault,
    view: &RoundView,
    max_rounds: usize,
) -> Result<Value, Error> {
    let planned_start_at = assault.prime_datetime() + Duration::minutes(30) * (view.round - 1);

    let (clan_a, clan_b) = match view.pair {
        Some((clan_a, clan_b)) => (
            clan_with_arena_json(store, clan_a, &assault.arena_id).await?,
            clan_with_arena_json(store, clan_b, &assault.arena_id).await?,
        ),
        None => (Value::Null, Value::Null),
    };

    Ok(json!({
        "round": view.round,
        "title": round_title(view.round, max_rounds),
        "planned_start_at": planned_start_at.to_rfc3339(),
        "real_start_at": view
            .real
            .as_ref()
            .map(|battle| json!(battle.start_at.to_rfc3339()))
            .unwrap_or(Value::Null),
        "clan_a": clan_a,
        "clan_b": clan_b,
        "winner": match view.winner {
            Some(winner) => clan_json(store, winner).await?,
            None => Value::Null,
        },
    }))
}

async fn clan_json(store: &dyn Store, clan_id: ClanId) -> Result<Value, Error> {
    let clan = store
        .clan(clan_id)
        .await?
        .unwrap_or_else(|| Clan::stub(clan_id));

    Ok(json!({
        "clan_id": clan.id,
        "tag": clan.tag,
        "name": clan.title,
        "elo_6": clan.elo_6,
        "elo_8": clan.elo_8,
        "elo_10": clan.elo_10,
    }))
}

async fn clan_with_arena_json(
    store: &dyn Store,
    clan_id: ClanId,
    arena_id: &str,
) -> Result<Value, Error> {
    let mut value = clan_json(store, clan_id).await?;

    let arena_stat = match store.arena_stat(clan_id, arena_id).await? {
        Some(stat) => json!({
            "wins_percent": stat.wins_percent,
            "battles_count": stat.battles_count,
        }),
        None => json!({
            "wins_percent": 0.0,
            "battles_count": 0,
        }),
    };

    if let Value::Object(map) = &mut value {
        map.insert("arena_stat".to_string(), arena_stat);
    }

    Ok(value)
}
