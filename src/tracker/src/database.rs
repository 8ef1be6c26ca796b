use crate::error::Error;
use crate::store::{
    Assault, Battle, BattleKey, Clan, ClanArenaStat, ClanId, Front, Status, Store, Territory,
};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use log::error;
use mysql_async::{params, prelude::Queryable, Conn, Opts, Pool, TxOpts};
use std::collections::BTreeSet;

/// MySQL-backed [`Store`]. The schema (sql/schema.sql) enforces the
/// uniqueness invariants through primary keys, which is what makes repeated
/// polls and concurrent reconciliation of different territories safe.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

impl Database {
    pub fn connect(database_uri: &str) -> Result<Self, Error> {
        let opts = Opts::from_url(database_uri)
            .map_err(|e| Error::Database(format!("[connect] {}", e)))?;

        Ok(Database {
            pool: Pool::new(opts),
        })
    }

    /// Verifies the pool actually reaches a server. Called once at boot so a
    /// bad URI fails loudly instead of on the first poll cycle.
    pub async fn ping(&self) -> Result<(), Error> {
        let mut connection = self.connection().await?;
        connection
            .query_drop("SELECT 1")
            .await
            .map_err(Error::from)
    }

    async fn connection(&self) -> Result<Conn, Error> {
        self.pool.get_conn().await.map_err(|e| {
            error!("[connection] ❌ {}", e);
            Error::from(e)
        })
    }
}

type AssaultRow = (
    String,
    NaiveDate,
    Option<u64>,
    NaiveTime,
    String,
    Option<i32>,
    Option<String>,
    Option<String>,
);

fn assault_from_row(row: AssaultRow, participants: BTreeSet<ClanId>) -> Assault {
    let (territory_id, date, current_owner, prime_time, arena_id, round_number, landing_type, status) =
        row;

    Assault {
        territory_id,
        date,
        current_owner,
        prime_time,
        arena_id,
        round_number,
        landing_type,
        status: status.as_deref().and_then(Status::parse),
        participants,
    }
}

type BattleRow = (
    String,
    NaiveDate,
    i32,
    u64,
    u64,
    NaiveDateTime,
    String,
    Option<u64>,
);

fn battle_from_row(row: BattleRow) -> Battle {
    let (territory_id, date, round, clan_a, clan_b, start_at, arena_id, winner) = row;

    Battle {
        territory_id,
        date,
        round,
        clan_a,
        clan_b,
        start_at: start_at.and_utc(),
        arena_id,
        winner,
    }
}

async fn participants_for(
    connection: &mut Conn,
    territory_id: &str,
    date: NaiveDate,
) -> Result<BTreeSet<ClanId>, Error> {
    let clans: Vec<u64> = connection
        .exec(
            "SELECT clan_id FROM assault_clan WHERE territory_id = :territory_id AND date = :date",
            params! { "territory_id" => territory_id, "date" => date },
        )
        .await?;

    Ok(clans.into_iter().collect())
}

#[async_trait]
impl Store for Database {
    async fn clan(&self, id: ClanId) -> Result<Option<Clan>, Error> {
        let mut connection = self.connection().await?;

        let row: Option<(u64, Option<String>, Option<String>, Option<i32>, Option<i32>, Option<i32>)> =
            connection
                .exec_first(
                    "SELECT id, tag, title, elo_6, elo_8, elo_10 FROM clan WHERE id = :id",
                    params! { "id" => id },
                )
                .await?;

        Ok(row.map(|(id, tag, title, elo_6, elo_8, elo_10)| Clan {
            id,
            tag,
            title,
            elo_6,
            elo_8,
            elo_10,
        }))
    }

    async fn get_or_create_clan(&self, id: ClanId) -> Result<Clan, Error> {
        let mut connection = self.connection().await?;

        connection
            .exec_drop(
                "INSERT IGNORE INTO clan (id) VALUES (:id)",
                params! { "id" => id },
            )
            .await?;
        drop(connection);

        match self.clan(id).await? {
            Some(clan) => Ok(clan),
            None => Err(Error::Database(format!(
                "[get_or_create_clan] clan {id} vanished between insert and select"
            ))),
        }
    }

    async fn update_clan(&self, clan: &Clan) -> Result<(), Error> {
        let mut connection = self.connection().await?;

        connection
            .exec_drop(
                r#"
                INSERT INTO clan (id, tag, title, elo_6, elo_8, elo_10)
                VALUES (:id, :tag, :title, :elo_6, :elo_8, :elo_10)
                ON DUPLICATE KEY UPDATE
                    tag = VALUES(tag),
                    title = VALUES(title),
                    elo_6 = VALUES(elo_6),
                    elo_8 = VALUES(elo_8),
                    elo_10 = VALUES(elo_10)
            "#,
                params! {
                    "id" => clan.id,
                    "tag" => &clan.tag,
                    "title" => &clan.title,
                    "elo_6" => clan.elo_6,
                    "elo_8" => clan.elo_8,
                    "elo_10" => clan.elo_10,
                },
            )
            .await
            .map_err(Error::from)
    }

    async fn arena_stat(
        &self,
        clan_id: ClanId,
        arena_id: &str,
    ) -> Result<Option<ClanArenaStat>, Error> {
        let mut connection = self.connection().await?;

        let row: Option<(u64, String, f64, i32)> = connection
            .exec_first(
                r#"
                SELECT clan_id, arena_id, wins_percent, battles_count
                FROM clan_arena_stat
                WHERE clan_id = :clan_id AND arena_id = :arena_id
            "#,
                params! { "clan_id" => clan_id, "arena_id" => arena_id },
            )
            .await?;

        Ok(
            row.map(|(clan_id, arena_id, wins_percent, battles_count)| ClanArenaStat {
                clan_id,
                arena_id,
                wins_percent,
                battles_count,
            }),
        )
    }

    async fn upsert_arena_stat(&self, stat: &ClanArenaStat) -> Result<(), Error> {
        let mut connection = self.connection().await?;

        connection
            .exec_drop(
                r#"
                INSERT INTO clan_arena_stat (clan_id, arena_id, wins_percent, battles_count)
                VALUES (:clan_id, :arena_id, :wins_percent, :battles_count)
                ON DUPLICATE KEY UPDATE
                    wins_percent = VALUES(wins_percent),
                    battles_count = VALUES(battles_count)
            "#,
                params! {
                    "clan_id" => stat.clan_id,
                    "arena_id" => &stat.arena_id,
                    "wins_percent" => stat.wins_percent,
                    "battles_count" => stat.battles_count,
                },
            )
            .await
            .map_err(Error::from)
    }

    async fn front(&self, front_id: &str) -> Result<Option<Front>, Error> {
        let mut connection = self.connection().await?;

        let row: Option<(String, i32)> = connection
            .exec_first(
                "SELECT front_id, max_vehicle_level FROM front WHERE front_id = :front_id",
                params! { "front_id" => front_id },
            )
            .await?;

        Ok(row.map(|(front_id, max_vehicle_level)| Front {
            front_id,
            max_vehicle_level,
        }))
    }

    async fn upsert_front(&self, front: &Front) -> Result<(), Error> {
        let mut connection = self.connection().await?;

        connection
            .exec_drop(
                r#"
                INSERT INTO front (front_id, max_vehicle_level)
                VALUES (:front_id, :max_vehicle_level)
                ON DUPLICATE KEY UPDATE max_vehicle_level = VALUES(max_vehicle_level)
            "#,
                params! {
                    "front_id" => &front.front_id,
                    "max_vehicle_level" => front.max_vehicle_level,
                },
            )
            .await
            .map_err(Error::from)
    }

    async fn territory(&self, territory_id: &str) -> Result<Option<Territory>, Error> {
        let mut connection = self.connection().await?;

        let row: Option<(String, String, String, Option<u64>, String, String, NaiveTime, String)> =
            connection
                .exec_first(
                    r#"
                    SELECT territory_id, front_id, name, owner_clan_id, arena_id, arena_name,
                           prime_time, server
                    FROM territory
                    WHERE territory_id = :territory_id
                "#,
                    params! { "territory_id" => territory_id },
                )
                .await?;

        Ok(row.map(
            |(territory_id, front_id, name, owner_clan_id, arena_id, arena_name, prime_time, server)| {
                Territory {
                    territory_id,
                    front_id,
                    name,
                    owner_clan_id,
                    arena_id,
                    arena_name,
                    prime_time,
                    server,
                }
            },
        ))
    }

    async fn upsert_territory(&self, territory: &Territory) -> Result<(), Error> {
        let mut connection = self.connection().await?;

        connection
            .exec_drop(
                r#"
                INSERT INTO territory (territory_id, front_id, name, owner_clan_id, arena_id,
                                       arena_name, prime_time, server)
                VALUES (:territory_id, :front_id, :name, :owner_clan_id, :arena_id,
                        :arena_name, :prime_time, :server)
                ON DUPLICATE KEY UPDATE
                    front_id = VALUES(front_id),
                    name = VALUES(name),
                    owner_clan_id = VALUES(owner_clan_id),
                    arena_id = VALUES(arena_id),
                    arena_name = VALUES(arena_name),
                    prime_time = VALUES(prime_time),
                    server = VALUES(server)
            "#,
                params! {
                    "territory_id" => &territory.territory_id,
                    "front_id" => &territory.front_id,
                    "name" => &territory.name,
                    "owner_clan_id" => territory.owner_clan_id,
                    "arena_id" => &territory.arena_id,
                    "arena_name" => &territory.arena_name,
                    "prime_time" => territory.prime_time,
                    "server" => &territory.server,
                },
            )
            .await
            .map_err(Error::from)
    }

    async fn assault(
        &self,
        territory_id: &str,
        date: NaiveDate,
    ) -> Result<Option<Assault>, Error> {
        let mut connection = self.connection().await?;

        let row: Option<AssaultRow> = connection
            .exec_first(
                r#"
                SELECT territory_id, date, current_owner_id, prime_time, arena_id,
                       round_number, landing_type, status
                FROM assault
                WHERE territory_id = :territory_id AND date = :date
            "#,
                params! { "territory_id" => territory_id, "date" => date },
            )
            .await?;

        match row {
            Some(row) => {
                let participants = participants_for(&mut connection, territory_id, date).await?;
                Ok(Some(assault_from_row(row, participants)))
            }
            None => Ok(None),
        }
    }

    async fn assaults_for_territory(&self, territory_id: &str) -> Result<Vec<Assault>, Error> {
        let mut connection = self.connection().await?;

        let rows: Vec<AssaultRow> = connection
            .exec(
                r#"
                SELECT territory_id, date, current_owner_id, prime_time, arena_id,
                       round_number, landing_type, status
                FROM assault
                WHERE territory_id = :territory_id
                ORDER BY date
            "#,
                params! { "territory_id" => territory_id },
            )
            .await?;

        let mut assaults = Vec::with_capacity(rows.len());
        for row in rows {
            let participants = participants_for(&mut connection, territory_id, row.1).await?;
            assaults.push(assault_from_row(row, participants));
        }

        Ok(assaults)
    }

    async fn latest_assaults(&self) -> Result<Vec<Assault>, Error> {
        let mut connection = self.connection().await?;

        let rows: Vec<AssaultRow> = connection
            .query(
                r#"
                SELECT a.territory_id, a.date, a.current_owner_id, a.prime_time, a.arena_id,
                       a.round_number, a.landing_type, a.status
                FROM assault a
                INNER JOIN (
                    SELECT territory_id, MAX(date) AS max_date
                    FROM assault
                    GROUP BY territory_id
                ) latest
                ON latest.territory_id = a.territory_id AND latest.max_date = a.date
            "#,
            )
            .await?;

        let mut assaults = Vec::with_capacity(rows.len());
        for row in rows {
            let territory_id = row.0.clone();
            let participants = participants_for(&mut connection, &territory_id, row.1).await?;
            assaults.push(assault_from_row(row, participants));
        }

        Ok(assaults)
    }

    async fn update_or_create_assault(&self, assault: &Assault) -> Result<bool, Error> {
        let mut connection = self.connection().await?;

        connection
            .exec_drop(
                r#"
                INSERT INTO assault (territory_id, date, current_owner_id, prime_time, arena_id,
                                     round_number, landing_type, status)
                VALUES (:territory_id, :date, :current_owner_id, :prime_time, :arena_id,
                        :round_number, :landing_type, :status)
                ON DUPLICATE KEY UPDATE
                    current_owner_id = VALUES(current_owner_id),
                    prime_time = VALUES(prime_time),
                    arena_id = VALUES(arena_id),
                    round_number = VALUES(round_number),
                    landing_type = VALUES(landing_type),
                    status = VALUES(status)
            "#,
                params! {
                    "territory_id" => &assault.territory_id,
                    "date" => assault.date,
                    "current_owner_id" => assault.current_owner,
                    "prime_time" => assault.prime_time,
                    "arena_id" => &assault.arena_id,
                    "round_number" => assault.round_number,
                    "landing_type" => &assault.landing_type,
                    "status" => assault.status.map(Status::as_str),
                },
            )
            .await?;

        // MySQL reports 1 affected row for an insert, 2 for an update and 0
        // when every value already matched.
        Ok(connection.affected_rows() == 1)
    }

    async fn set_participants(
        &self,
        territory_id: &str,
        date: NaiveDate,
        clans: &BTreeSet<ClanId>,
    ) -> Result<(), Error> {
        let mut connection = self.connection().await?;
        let mut tx = connection.start_transaction(TxOpts::default()).await?;

        tx.exec_drop(
            "DELETE FROM assault_clan WHERE territory_id = :territory_id AND date = :date",
            params! { "territory_id" => territory_id, "date" => date },
        )
        .await?;

        tx.exec_batch(
            r#"
            INSERT INTO assault_clan (territory_id, date, clan_id)
            VALUES (:territory_id, :date, :clan_id)
        "#,
            clans.iter().map(|clan_id| {
                params! {
                    "territory_id" => territory_id,
                    "date" => date,
                    "clan_id" => clan_id,
                }
            }),
        )
        .await?;

        tx.commit().await.map_err(Error::from)
    }

    async fn set_status(
        &self,
        territory_id: &str,
        date: NaiveDate,
        status: Status,
    ) -> Result<(), Error> {
        let mut connection = self.connection().await?;

        connection
            .exec_drop(
                r#"
                UPDATE assault SET status = :status
                WHERE territory_id = :territory_id AND date = :date
            "#,
                params! {
                    "territory_id" => territory_id,
                    "date" => date,
                    "status" => status.as_str(),
                },
            )
            .await
            .map_err(Error::from)
    }

    async fn delete_assault(&self, territory_id: &str, date: NaiveDate) -> Result<(), Error> {
        let mut connection = self.connection().await?;
        let mut tx = connection.start_transaction(TxOpts::default()).await?;

        for table in ["battle", "assault_clan", "assault"] {
            tx.exec_drop(
                format!(
                    "DELETE FROM {table} WHERE territory_id = :territory_id AND date = :date"
                ),
                params! { "territory_id" => territory_id, "date" => date },
            )
            .await?;
        }

        tx.commit().await.map_err(Error::from)
    }

    async fn upsert_battle(&self, battle: &Battle) -> Result<bool, Error> {
        let mut connection = self.connection().await?;

        connection
            .exec_drop(
                r#"
                INSERT INTO battle (territory_id, date, round, clan_a_id, clan_b_id,
                                    start_at, arena_id)
                VALUES (:territory_id, :date, :round, :clan_a_id, :clan_b_id,
                        :start_at, :arena_id)
                ON DUPLICATE KEY UPDATE
                    start_at = VALUES(start_at),
                    arena_id = VALUES(arena_id)
            "#,
                params! {
                    "territory_id" => &battle.territory_id,
                    "date" => battle.date,
                    "round" => battle.round,
                    "clan_a_id" => battle.clan_a,
                    "clan_b_id" => battle.clan_b,
                    "start_at" => battle.start_at.naive_utc(),
                    "arena_id" => &battle.arena_id,
                },
            )
            .await?;

        Ok(connection.affected_rows() == 1)
    }

    async fn battles(&self, territory_id: &str, date: NaiveDate) -> Result<Vec<Battle>, Error> {
        let mut connection = self.connection().await?;

        let rows: Vec<BattleRow> = connection
            .exec(
                r#"
                SELECT territory_id, date, round, clan_a_id, clan_b_id, start_at, arena_id,
                       winner_id
                FROM battle
                WHERE territory_id = :territory_id AND date = :date
                ORDER BY round, start_at
            "#,
                params! { "territory_id" => territory_id, "date" => date },
            )
            .await?;

        Ok(rows.into_iter().map(battle_from_row).collect())
    }

    async fn unresolved_battles(&self, clan_id: ClanId) -> Result<Vec<Battle>, Error> {
        let mut connection = self.connection().await?;

        let rows: Vec<BattleRow> = connection
            .exec(
                r#"
                SELECT territory_id, date, round, clan_a_id, clan_b_id, start_at, arena_id,
                       winner_id
                FROM battle
                WHERE winner_id IS NULL AND (clan_a_id = :clan_id OR clan_b_id = :clan_id)
                ORDER BY start_at, round
            "#,
                params! { "clan_id" => clan_id },
            )
            .await?;

        Ok(rows.into_iter().map(battle_from_row).collect())
    }

    async fn set_battle_winner(&self, key: &BattleKey, winner: ClanId) -> Result<(), Error> {
        let mut connection = self.connection().await?;

        connection
            .exec_drop(
                r#"
                UPDATE battle SET winner_id = :winner_id
                WHERE territory_id = :territory_id
                  AND date = :date
                  AND round = :round
                  AND clan_a_id = :clan_a_id
                  AND clan_b_id = :clan_b_id
                  AND winner_id IS NULL
            "#,
                params! {
                    "winner_id" => winner,
                    "territory_id" => &key.territory_id,
                    "date" => key.date,
                    "round" => key.round,
                    "clan_a_id" => key.clan_a,
                    "clan_b_id" => key.clan_b,
                },
            )
            .await
            .map_err(Error::from)
    }
}
