#![deny(warnings)]

//! SQLite persistence for the deployment engine.
//!
//! `SqliteStore` implements the engine's store port. Conditional writes are
//! enforced by SQL (`ON CONFLICT DO NOTHING`, `WHERE remaining >= ?`) and
//! settlements run in a single transaction that opens with the conditional
//! write on the deployment row.

use chrono::{DateTime, TimeZone, Utc};
use deploy_core::{
    validate_deposit, Asset, AssetCategory, AssetConfig, AssetId, Deposit, DepositId,
    DeploymentLogEntry, DeploymentRecord, Holding, OwnerId, ResourceKind, SiteId, Target,
};
use deploy_engine::{
    DeploymentStore, HoldingCredit, RecordAction, SettleOutcome, Settlement, StoreError,
    StoreResult,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

/// Returns the default SQLite URL used for local saves.
pub fn default_sqlite_url() -> &'static str {
    "sqlite://./saves/engine.db"
}

/// Open (creating if needed) the database at `url` and apply migrations.
pub async fn init_db(url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let mut pool = SqlitePoolOptions::new();
    if url.contains(":memory:") {
        // each connection to :memory: is a separate database
        pool = pool.max_connections(1).idle_timeout(None).max_lifetime(None);
    }
    let pool = pool.connect_with(options).await?;
    sqlx::migrate!().run(&pool).await?;
    info!(url, "database ready");
    Ok(pool)
}

fn store_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() || db.is_check_violation() || db.is_foreign_key_violation() {
            return StoreError::Conflict(db.to_string());
        }
    }
    match &err {
        sqlx::Error::Decode(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt(err.to_string()),
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn to_i64(v: u64, what: &str) -> StoreResult<i64> {
    i64::try_from(v).map_err(|_| StoreError::Corrupt(format!("{what} too large: {v}")))
}

fn to_u64(v: i64, what: &str) -> StoreResult<u64> {
    u64::try_from(v).map_err(|_| StoreError::Corrupt(format!("negative {what}: {v}")))
}

fn tier(v: i64, what: &str) -> StoreResult<u8> {
    u8::try_from(v).map_err(|_| StoreError::Corrupt(format!("{what} tier out of range: {v}")))
}

fn category(s: &str) -> StoreResult<AssetCategory> {
    AssetCategory::from_str(s).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn target(kind: &str, id: Option<&str>) -> StoreResult<Target> {
    Target::from_parts(kind, id).map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[derive(sqlx::FromRow)]
struct AssetRow {
    id: String,
    owner: String,
    site: String,
    category: String,
    speed: i64,
    capacity: i64,
    power: i64,
}

impl TryFrom<AssetRow> for Asset {
    type Error = StoreError;

    fn try_from(row: AssetRow) -> StoreResult<Self> {
        Ok(Asset {
            category: category(&row.category)?,
            config: AssetConfig {
                speed: tier(row.speed, "speed")?,
                capacity: tier(row.capacity, "capacity")?,
                power: tier(row.power, "power")?,
            },
            id: AssetId(row.id),
            owner: OwnerId(row.owner),
            site: SiteId(row.site),
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    asset_id: String,
    owner: String,
    category: String,
    started_at: i64,
    target_kind: String,
    target_id: Option<String>,
    duration_ms: Option<i64>,
    linked_automaton: Option<String>,
}

impl TryFrom<DeploymentRow> for DeploymentRecord {
    type Error = StoreError;

    fn try_from(row: DeploymentRow) -> StoreResult<Self> {
        Ok(DeploymentRecord {
            category: category(&row.category)?,
            start: from_ms(row.started_at)?,
            target: target(&row.target_kind, row.target_id.as_deref())?,
            duration_ms: row
                .duration_ms
                .map(|ms| to_u64(ms, "duration"))
                .transpose()?,
            asset: AssetId(row.asset_id),
            owner: OwnerId(row.owner),
            linked_automaton: row.linked_automaton.map(AssetId),
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    owner: String,
    category: String,
    asset_id: String,
    target_kind: String,
    target_id: Option<String>,
    started_at: i64,
}

impl TryFrom<LogRow> for DeploymentLogEntry {
    type Error = StoreError;

    fn try_from(row: LogRow) -> StoreResult<Self> {
        Ok(DeploymentLogEntry {
            category: category(&row.category)?,
            target: target(&row.target_kind, row.target_id.as_deref())?,
            started_at: from_ms(row.started_at)?,
            owner: OwnerId(row.owner),
            asset: AssetId(row.asset_id),
        })
    }
}

#[derive(sqlx::FromRow)]
struct DepositRow {
    id: String,
    site: String,
    resource: String,
    remaining: i64,
    purity: Option<f64>,
}

impl TryFrom<DepositRow> for Deposit {
    type Error = StoreError;

    fn try_from(row: DepositRow) -> StoreResult<Self> {
        Ok(Deposit {
            remaining: to_u64(row.remaining, "remaining")?,
            purity: row.purity.map(|p| p as f32),
            id: DepositId(row.id),
            site: SiteId(row.site),
            resource: ResourceKind(row.resource),
        })
    }
}

const LOG_COLUMNS: &str = "owner, category, asset_id, target_kind, target_id, started_at";

async fn debit(conn: &mut SqliteConnection, id: &DepositId, amount: u64) -> StoreResult<u64> {
    let amount = to_i64(amount, "amount")?;
    let updated: Option<i64> = sqlx::query_scalar(
        "UPDATE deposits SET remaining = remaining - ?1 \
         WHERE id = ?2 AND remaining >= ?1 RETURNING remaining",
    )
    .bind(amount)
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(store_err)?;
    if let Some(remaining) = updated {
        return to_u64(remaining, "remaining");
    }
    let current: Option<i64> = sqlx::query_scalar("SELECT remaining FROM deposits WHERE id = ?")
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(store_err)?;
    match current {
        Some(remaining) => Err(StoreError::InsufficientRemaining {
            deposit: id.clone(),
            remaining: to_u64(remaining, "remaining")?,
            requested: to_u64(amount, "amount")?,
        }),
        None => Err(StoreError::not_found("deposit", id)),
    }
}

async fn credit(conn: &mut SqliteConnection, credit: &HoldingCredit) -> StoreResult<u64> {
    let quantity: i64 = sqlx::query_scalar(
        "INSERT INTO holdings (owner, site, resource, quantity) VALUES (?, ?, ?, ?) \
         ON CONFLICT (owner, site, resource) DO UPDATE SET quantity = quantity + excluded.quantity \
         RETURNING quantity",
    )
    .bind(credit.owner.as_str())
    .bind(credit.site.as_str())
    .bind(credit.resource.as_str())
    .bind(to_i64(credit.amount, "amount")?)
    .fetch_one(&mut *conn)
    .await
    .map_err(store_err)?;
    to_u64(quantity, "quantity")
}

/// Store adapter over a SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        Ok(Self::new(init_db(url).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace an asset row.
    pub async fn upsert_asset(&self, asset: &Asset) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO assets (id, owner, site, category, speed, capacity, power) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET owner = excluded.owner, site = excluded.site, \
             category = excluded.category, speed = excluded.speed, \
             capacity = excluded.capacity, power = excluded.power",
        )
        .bind(asset.id.as_str())
        .bind(asset.owner.as_str())
        .bind(asset.site.as_str())
        .bind(asset.category.as_str())
        .bind(i64::from(asset.config.speed))
        .bind(i64::from(asset.config.capacity))
        .bind(i64::from(asset.config.power))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    /// Validate and insert or replace a deposit row.
    pub async fn upsert_deposit(&self, deposit: &Deposit) -> anyhow::Result<()> {
        validate_deposit(deposit)?;
        sqlx::query(
            "INSERT INTO deposits (id, site, resource, remaining, purity) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET site = excluded.site, resource = excluded.resource, \
             remaining = excluded.remaining, purity = excluded.purity",
        )
        .bind(deposit.id.as_str())
        .bind(deposit.site.as_str())
        .bind(deposit.resource.as_str())
        .bind(to_i64(deposit.remaining, "remaining")?)
        .bind(deposit.purity.map(f64::from))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }
}

impl DeploymentStore for SqliteStore {
    async fn read_asset(&self, id: &AssetId) -> StoreResult<Asset> {
        let row: Option<AssetRow> = sqlx::query_as(
            "SELECT id, owner, site, category, speed, capacity, power FROM assets WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.ok_or_else(|| StoreError::not_found("asset", id))?
            .try_into()
    }

    async fn read_active_deployment(&self, asset: &AssetId) -> StoreResult<Option<DeploymentRecord>> {
        let row: Option<DeploymentRow> = sqlx::query_as(
            "SELECT asset_id, owner, category, started_at, target_kind, target_id, duration_ms, \
             linked_automaton FROM deployments WHERE asset_id = ?",
        )
        .bind(asset.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(DeploymentRecord::try_from).transpose()
    }

    async fn write_deployment(&self, record: &DeploymentRecord) -> StoreResult<()> {
        let started_at = to_ms(record.start);
        let duration = record
            .duration_ms
            .map(|ms| to_i64(ms, "duration"))
            .transpose()?;
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let inserted = sqlx::query(
            "INSERT INTO deployments (asset_id, owner, category, started_at, target_kind, \
             target_id, duration_ms, linked_automaton) VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (asset_id) DO NOTHING",
        )
        .bind(record.asset.as_str())
        .bind(record.owner.as_str())
        .bind(record.category.as_str())
        .bind(started_at)
        .bind(record.target.kind())
        .bind(record.target.id())
        .bind(duration)
        .bind(record.linked_automaton.as_ref().map(AssetId::as_str))
        .execute(&mut *tx)
        .await
        .map_err(store_err)?
        .rows_affected();
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "asset {} already has an active deployment",
                record.asset
            )));
        }
        sqlx::query(&format!(
            "INSERT INTO deployment_log ({LOG_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
        ))
        .bind(record.owner.as_str())
        .bind(record.category.as_str())
        .bind(record.asset.as_str())
        .bind(record.target.kind())
        .bind(record.target.id())
        .bind(started_at)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;
        debug!(asset = %record.asset, "deployment row written");
        Ok(())
    }

    async fn clear_deployment(&self, asset: &AssetId) -> StoreResult<()> {
        sqlx::query("DELETE FROM deployments WHERE asset_id = ?")
            .bind(asset.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn restart_deployment(
        &self,
        asset: &AssetId,
        expected: DateTime<Utc>,
        new_start: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let updated = sqlx::query(
            "UPDATE deployments SET started_at = ? WHERE asset_id = ? AND started_at = ?",
        )
        .bind(to_ms(new_start))
        .bind(asset.as_str())
        .bind(to_ms(expected))
        .execute(&self.pool)
        .await
        .map_err(store_err)?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn read_deposit(&self, id: &DepositId) -> StoreResult<Deposit> {
        let row: Option<DepositRow> = sqlx::query_as(
            "SELECT id, site, resource, remaining, purity FROM deposits WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.ok_or_else(|| StoreError::not_found("deposit", id))?
            .try_into()
    }

    async fn decrement_deposit(&self, id: &DepositId, amount: u64) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        debit(&mut conn, id, amount).await
    }

    async fn credit_holding(&self, holding: &HoldingCredit) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        credit(&mut conn, holding).await
    }

    async fn read_holding(
        &self,
        owner: &OwnerId,
        site: &SiteId,
        resource: &ResourceKind,
    ) -> StoreResult<Holding> {
        let quantity: Option<i64> = sqlx::query_scalar(
            "SELECT quantity FROM holdings WHERE owner = ? AND site = ? AND resource = ?",
        )
        .bind(owner.as_str())
        .bind(site.as_str())
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(Holding {
            owner: owner.clone(),
            site: site.clone(),
            resource: resource.clone(),
            quantity: quantity.map_or(Ok(0), |q| to_u64(q, "quantity"))?,
        })
    }

    async fn query_deployments_in_window(
        &self,
        owner: &OwnerId,
        category: AssetCategory,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DeploymentLogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(&format!(
            "SELECT {LOG_COLUMNS} FROM deployment_log \
             WHERE owner = ? AND category = ? AND started_at >= ? ORDER BY started_at, id"
        ))
        .bind(owner.as_str())
        .bind(category.as_str())
        .bind(to_ms(since))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.into_iter().map(DeploymentLogEntry::try_from).collect()
    }

    async fn latest_log_entry(&self, asset: &AssetId) -> StoreResult<Option<DeploymentLogEntry>> {
        let row: Option<LogRow> = sqlx::query_as(&format!(
            "SELECT {LOG_COLUMNS} FROM deployment_log WHERE asset_id = ? \
             ORDER BY started_at DESC, id DESC LIMIT 1"
        ))
        .bind(asset.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(DeploymentLogEntry::try_from).transpose()
    }

    async fn settle(&self, settlement: &Settlement) -> StoreResult<SettleOutcome> {
        let expected = to_ms(settlement.expected_start);
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        // First statement is the write on the record, so the write lock is taken
        // up front and a concurrent settle of the same start matches no row.
        let claimed = match settlement.after {
            RecordAction::Clear => {
                sqlx::query("DELETE FROM deployments WHERE asset_id = ? AND started_at = ?")
                    .bind(settlement.asset.as_str())
                    .bind(expected)
                    .execute(&mut *tx)
                    .await
            }
            RecordAction::Restart(at) => {
                sqlx::query(
                    "UPDATE deployments SET started_at = ? WHERE asset_id = ? AND started_at = ?",
                )
                .bind(to_ms(at))
                .bind(settlement.asset.as_str())
                .bind(expected)
                .execute(&mut *tx)
                .await
            }
        }
        .map_err(store_err)?
        .rows_affected();
        if claimed == 0 {
            return Ok(SettleOutcome::AlreadySettled);
        }
        if let Some((deposit, amount)) = &settlement.debit {
            debit(&mut tx, deposit, *amount).await?;
        }
        if let Some(holding) = &settlement.credit {
            credit(&mut tx, holding).await?;
        }
        tx.commit().await.map_err(store_err)?;
        debug!(asset = %settlement.asset, "settlement committed");
        Ok(SettleOutcome::Applied)
    }
}
