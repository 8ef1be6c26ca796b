use crate::config::Config;
use crate::error::Error;
use crate::snapshot::{opt_clan_id, RawTerritory};
use crate::store::ClanId;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Result-log event kinds. Only result events carry a winner worth
/// matching; everything else in the feed (applications, revenue, map chatter)
/// decodes to `Unknown` and is skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEventType {
    TournamentBattleWon,
    TournamentBattleLost,
    TerritoryCaptured,
    TerritoryDefended,

    #[serde(other)]
    #[default]
    Unknown,
}

impl LogEventType {
    pub fn is_result(self) -> bool {
        !matches!(self, LogEventType::Unknown)
    }
}

/// One raw result-log entry as polled from the clan log endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLogEntry {
    #[serde(rename = "type", default)]
    pub event: LogEventType,

    #[serde(default)]
    pub target_territory_id: String,

    #[serde(default)]
    pub created_at: String,

    #[serde(default, deserialize_with = "opt_clan_id")]
    pub winner_clan_id: Option<ClanId>,

    #[serde(default, deserialize_with = "opt_clan_id")]
    pub enemy_clan_id: Option<ClanId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMapInfo {
    #[serde(default)]
    pub state: String,
}

impl RawMapInfo {
    /// Upstream freezes the whole map during maintenance; snapshots polled
    /// in that window are garbage.
    pub fn is_frozen(&self) -> bool {
        self.state == "frozen"
    }
}

/// One battle reference from the clan battles endpoint; just enough to know
/// which territories are worth polling.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBattleRef {
    #[serde(default)]
    pub territory_id: String,

    #[serde(default)]
    pub front_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawClanBattles {
    #[serde(default)]
    pub battles: Vec<RawBattleRef>,

    #[serde(default)]
    pub planned_battles: Vec<RawBattleRef>,
}

/// Clan card as embedded in the tournament page: identity plus ratings and
/// per-arena performance.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawClanRating {
    #[serde(default, deserialize_with = "opt_clan_id")]
    pub id: Option<ClanId>,

    #[serde(default, deserialize_with = "opt_clan_id")]
    pub clan_id: Option<ClanId>,

    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub elo_rating_6: Option<i32>,

    #[serde(default)]
    pub elo_rating_8: Option<i32>,

    #[serde(default)]
    pub elo_rating_10: Option<i32>,

    #[serde(default)]
    pub arena_wins_percent: Option<f64>,

    #[serde(default)]
    pub arena_battles_count: Option<i32>,
}

impl RawClanRating {
    // The tournament page uses `id` where the log uses `clan_id`; both show up.
    pub fn resolved_id(&self) -> Option<ClanId> {
        self.id.or(self.clan_id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTournamentBattle {
    #[serde(default)]
    pub first_competitor: Option<RawClanRating>,

    #[serde(default)]
    pub second_competitor: Option<RawClanRating>,
}

/// The unofficial per-territory tournament page. Its pretender list is
/// fresher than the official competitor list and the embedded clan cards
/// are the only source of ratings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTournamentInfo {
    #[serde(default)]
    pub territory_id: String,

    #[serde(default)]
    pub owner: Option<RawClanRating>,

    #[serde(default)]
    pub pretenders: Option<Vec<RawClanRating>>,

    #[serde(default)]
    pub battles: Vec<RawTournamentBattle>,
}

impl RawTournamentInfo {
    /// Every clan card on the page keyed by id: both competitors of every
    /// listed battle plus the pretender list, minus the owner. A clan can
    /// appear only in battles without being listed as a pretender.
    pub fn clans_info(&self) -> BTreeMap<ClanId, &RawClanRating> {
        let mut clans: BTreeMap<ClanId, &RawClanRating> = BTreeMap::new();

        for battle in &self.battles {
            for competitor in [&battle.first_competitor, &battle.second_competitor] {
                if let Some(rating) = competitor {
                    if let Some(id) = rating.resolved_id() {
                        clans.insert(id, rating);
                    }
                }
            }
        }

        if let Some(pretenders) = &self.pretenders {
            for rating in pretenders {
                if let Some(id) = rating.resolved_id() {
                    clans.insert(id, rating);
                }
            }
        }

        if let Some(owner_id) = self.owner.as_ref().and_then(RawClanRating::resolved_id) {
            clans.remove(&owner_id);
        }

        clans
    }

    pub fn pretender_ids(&self) -> Vec<ClanId> {
        self.clans_info().keys().copied().collect()
    }
}

/// Clan identity from the clans info endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawClanInfo {
    #[serde(default, deserialize_with = "opt_clan_id")]
    pub clan_id: Option<ClanId>,

    #[serde(default)]
    pub tag: Option<String>,

    #[serde(default)]
    pub name: Option<String>,
}

/// Boundary to the upstream service. Everything behind this trait is a
/// plain fetch: no retries, no caching, no writes. A failed call surfaces
/// as [`Error::UpstreamFetch`] and the poller skips the affected batch.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn map_info(&self) -> Result<RawMapInfo, Error>;

    /// Polls raw snapshots for up to a batch worth of territories of one
    /// front.
    async fn territories(
        &self,
        front_id: &str,
        territory_ids: &[String],
    ) -> Result<Vec<RawTerritory>, Error>;

    async fn tournament_info(&self, territory_id: &str) -> Result<RawTournamentInfo, Error>;

    async fn clan_battles(&self, clan_id: ClanId) -> Result<RawClanBattles, Error>;

    async fn clan_log(&self, clan_id: ClanId) -> Result<Vec<RawLogEntry>, Error>;

    async fn clan_info(&self, clan_ids: &[ClanId]) -> Result<Vec<RawClanInfo>, Error>;
}

// The official API wraps every payload; the game_api endpoints return bare
// JSON.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: String,

    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct RawClanLog {
    #[serde(default)]
    events: Vec<RawLogEntry>,
}

/// Reqwest-backed [`UpstreamApi`].
pub struct HttpApi {
    client: reqwest::Client,
    api_host: String,
    game_host: String,
    application_id: String,
}

impl HttpApi {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout()?)
            .build()?;

        Ok(HttpApi {
            client,
            api_host: config.api_host.trim_end_matches('/').to_string(),
            game_host: config.game_host.trim_end_matches('/').to_string(),
            application_id: config.application_id.clone(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, Error> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?;

        response.json::<T>().await.map_err(Error::from)
    }

    async fn get_data<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, Error> {
        let envelope: Envelope<T> = self.get_json(url, query).await?;

        if envelope.status != "ok" {
            return Err(Error::fetch(
                url,
                format!("upstream status {:?}", envelope.status),
            ));
        }

        envelope
            .data
            .ok_or_else(|| Error::fetch(url, "missing data payload"))
    }
}

#[async_trait]
impl UpstreamApi for HttpApi {
    async fn map_info(&self) -> Result<RawMapInfo, Error> {
        let url = format!("{}/wot/globalmap/info/", self.api_host);
        self.get_data(&url, &[("application_id", self.application_id.as_str())])
            .await
    }

    async fn territories(
        &self,
        front_id: &str,
        territory_ids: &[String],
    ) -> Result<Vec<RawTerritory>, Error> {
        let url = format!("{}/wot/globalmap/territories/", self.api_host);
        let ids = territory_ids.join(",");

        self.get_data(
            &url,
            &[
                ("application_id", self.application_id.as_str()),
                ("front_id", front_id),
                ("territory_id", ids.as_str()),
            ],
        )
        .await
    }

    async fn tournament_info(&self, territory_id: &str) -> Result<RawTournamentInfo, Error> {
        let url = format!("{}/globalmap/game_api/tournament_info", self.game_host);
        self.get_json(&url, &[("alias", territory_id)]).await
    }

    async fn clan_battles(&self, clan_id: ClanId) -> Result<RawClanBattles, Error> {
        let url = format!("{}/globalmap/game_api/clan/{}/battles", self.game_host, clan_id);
        self.get_json(&url, &[]).await
    }

    async fn clan_log(&self, clan_id: ClanId) -> Result<Vec<RawLogEntry>, Error> {
        let url = format!("{}/globalmap/game_api/clan/{}/log", self.game_host, clan_id);
        let log: RawClanLog = self.get_json(&url, &[]).await?;
        Ok(log.events)
    }

    async fn clan_info(&self, clan_ids: &[ClanId]) -> Result<Vec<RawClanInfo>, Error> {
        let url = format!("{}/wgn/clans/info/", self.api_host);
        let ids = clan_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let by_id: BTreeMap<String, Option<RawClanInfo>> = self
            .get_data(
                &url,
                &[
                    ("application_id", self.application_id.as_str()),
                    ("clan_id", ids.as_str()),
                ],
            )
            .await?;

        Ok(by_id.into_values().flatten().collect())
    }
}
