use crate::api::{RawClanRating, UpstreamApi};
use crate::error::Error;
use crate::store::{Clan, ClanArenaStat, ClanId, Store};
use log::{debug, warn};

/// Returns the clan, creating a stub if unseen and enriching the stub with
/// upstream identity when possible. Enrichment is opportunistic: a failed
/// info fetch logs a warning and the stub is returned as-is.
pub async fn resolve_or_create(
    api: &dyn UpstreamApi,
    store: &dyn Store,
    clan_id: ClanId,
) -> Result<Clan, Error> {
    let clan = store.get_or_create_clan(clan_id).await?;
    if !clan.is_stub() {
        return Ok(clan);
    }

    match enrich_clans(api, store, &[clan_id]).await {
        Ok(_) => store
            .clan(clan_id)
            .await
            .map(|clan| clan.unwrap_or_else(|| Clan::stub(clan_id))),
        Err(e) => {
            warn!("[resolve_or_create] ⚠ clan {} stays a stub - {}", clan_id, e);
            Ok(clan)
        }
    }
}

/// Fetches identity for a batch of clans and merges it into the store.
/// Returns how many records were updated.
pub async fn enrich_clans(
    api: &dyn UpstreamApi,
    store: &dyn Store,
    clan_ids: &[ClanId],
) -> Result<usize, Error> {
    if clan_ids.is_empty() {
        return Ok(0);
    }

    let infos = api.clan_info(clan_ids).await?;
    let mut updated = 0;

    for info in infos {
        let Some(clan_id) = info.clan_id else {
            continue;
        };

        let mut clan = store.get_or_create_clan(clan_id).await?;
        clan.tag = info.tag.or(clan.tag);
        clan.title = info.name.or(clan.title);
        store.update_clan(&clan).await?;
        updated += 1;

        debug!("[enrich_clans] updated clan {} ({:?})", clan_id, clan.tag);
    }

    Ok(updated)
}

/// Merges a clan card from the tournament page: identity, ratings and the
/// per-arena stat. This is the only source of elo and arena numbers.
pub async fn update_clan_rating(
    store: &dyn Store,
    arena_id: &str,
    rating: &RawClanRating,
) -> Result<(), Error> {
    let Some(clan_id) = rating.resolved_id() else {
        return Ok(());
    };

    let mut clan = store.get_or_create_clan(clan_id).await?;
    clan.tag = rating.tag.clone().or(clan.tag);
    clan.title = rating.name.clone().or(clan.title);
    clan.elo_6 = rating.elo_rating_6.or(clan.elo_6);
    clan.elo_8 = rating.elo_rating_8.or(clan.elo_8);
    clan.elo_10 = rating.elo_rating_10.or(clan.elo_10);
    store.update_clan(&clan).await?;

    if let (Some(wins_percent), Some(battles_count)) =
        (rating.arena_wins_percent, rating.arena_battles_count)
    {
        store
            .upsert_arena_stat(&ClanArenaStat {
                clan_id,
                arena_id: arena_id.to_string(),
                wins_percent,
                battles_count,
            })
            .await?;
    }

    Ok(())
}
