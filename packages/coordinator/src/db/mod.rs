use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::error;

pub mod models;

pub use models::*;

use crate::ledger::LedgerStore;
use crate::types::{BlockRef, Chain, Transfer};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

const UPSERT_TRANSFER: &str = r#"
    INSERT INTO transfers (transfer_hash, direction, user_address, origin_token,
        destination_token, claimed_destination_token, amount, origin_nonce, origin_hash,
        state, origin_confirmed_at, origin_block_hash, destination_tx, destination_applied_at,
        challenge_deadline, failure, review, attempts, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC, $8::NUMERIC, $9, $10, $11, $12, $13, $14,
        $15, $16, $17, $18, $19, $20)
    ON CONFLICT (transfer_hash) DO UPDATE SET
        destination_token = EXCLUDED.destination_token,
        state = EXCLUDED.state,
        origin_confirmed_at = EXCLUDED.origin_confirmed_at,
        origin_block_hash = EXCLUDED.origin_block_hash,
        destination_tx = EXCLUDED.destination_tx,
        destination_applied_at = EXCLUDED.destination_applied_at,
        challenge_deadline = EXCLUDED.challenge_deadline,
        failure = EXCLUDED.failure,
        review = EXCLUDED.review,
        attempts = EXCLUDED.attempts,
        updated_at = EXCLUDED.updated_at
"#;

fn bind_transfer<'q>(
    row: &'q TransferRow,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(UPSERT_TRANSFER)
        .bind(&row.transfer_hash)
        .bind(&row.direction)
        .bind(&row.user_address)
        .bind(&row.origin_token)
        .bind(&row.destination_token)
        .bind(&row.claimed_destination_token)
        .bind(&row.amount)
        .bind(&row.origin_nonce)
        .bind(&row.origin_hash)
        .bind(&row.state)
        .bind(row.origin_confirmed_at)
        .bind(&row.origin_block_hash)
        .bind(&row.destination_tx)
        .bind(row.destination_applied_at)
        .bind(row.challenge_deadline)
        .bind(&row.failure)
        .bind(&row.review)
        .bind(row.attempts)
        .bind(row.created_at)
        .bind(row.updated_at)
}

/// Insert or update one transfer row
pub async fn upsert_transfer(pool: &PgPool, transfer: &Transfer) -> Result<()> {
    let row = TransferRow::try_from(transfer)?;
    bind_transfer(&row)
        .execute(pool)
        .await
        .wrap_err_with(|| format!("Failed to save transfer {}", transfer.transfer_hash))?;
    Ok(())
}

/// Get every transfer in the ledger
pub async fn get_transfers(pool: &PgPool) -> Result<Vec<Transfer>> {
    // Cast NUMERIC columns to TEXT since sqlx can't convert them to String
    let rows = sqlx::query_as::<_, TransferRow>(
        r#"SELECT transfer_hash, direction, user_address, origin_token, destination_token,
                  claimed_destination_token, amount::TEXT as amount,
                  origin_nonce::TEXT as origin_nonce, origin_hash, state, origin_confirmed_at,
                  origin_block_hash, destination_tx, destination_applied_at, challenge_deadline,
                  failure, review, attempts, created_at, updated_at
           FROM transfers"#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| {
        error!("SQL error loading transfers: {:?}", e);
        e
    })
    .wrap_err("Failed to load transfers")?;

    rows.into_iter().map(Transfer::try_from).collect()
}

/// Get the last delivered block of a chain
pub async fn get_cursor(pool: &PgPool, chain: Chain) -> Result<Option<BlockRef>> {
    let row: Option<CursorRow> = sqlx::query_as(
        r#"SELECT chain, block_number, block_hash FROM chain_cursors WHERE chain = $1"#,
    )
    .bind(chain.as_str())
    .fetch_optional(pool)
    .await
    .wrap_err("Failed to get chain cursor")?;

    row.map(|r| {
        let number = u64::try_from(r.block_number)
            .map_err(|_| eyre!("negative cursor for chain {}", r.chain))?;
        let hash = r
            .block_hash
            .parse()
            .wrap_err_with(|| format!("invalid cursor hash for chain {}", r.chain))?;
        Ok(BlockRef::new(number, hash))
    })
    .transpose()
}

/// Update the last delivered block of a chain
pub async fn update_cursor(pool: &PgPool, chain: Chain, cursor: BlockRef) -> Result<()> {
    let number = i64::try_from(cursor.number)
        .map_err(|_| eyre!("cursor block {} does not fit in BIGINT", cursor.number))?;
    sqlx::query(
        r#"
        INSERT INTO chain_cursors (chain, block_number, block_hash)
        VALUES ($1, $2, $3)
        ON CONFLICT (chain) DO UPDATE SET block_number = $2, block_hash = $3, updated_at = NOW()
        "#,
    )
    .bind(chain.as_str())
    .bind(number)
    .bind(cursor.hash.to_string())
    .execute(pool)
    .await
    .wrap_err_with(|| format!("Failed to update cursor for chain {}", chain))?;

    Ok(())
}

/// Postgres-backed [`LedgerStore`]
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and bring the schema up to date
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn load_transfers(&self) -> Result<Vec<Transfer>> {
        get_transfers(&self.pool).await
    }

    async fn save_transfer(&self, transfer: &Transfer) -> Result<()> {
        upsert_transfer(&self.pool, transfer).await
    }

    /// All rows commit together, so a reorg rollback is never half-applied
    async fn save_transfers(&self, transfers: &[Transfer]) -> Result<()> {
        let rows = transfers
            .iter()
            .map(TransferRow::try_from)
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err("Failed to begin transaction")?;
        for row in &rows {
            bind_transfer(row)
                .execute(&mut *tx)
                .await
                .wrap_err_with(|| format!("Failed to save transfer {}", row.transfer_hash))?;
        }
        tx.commit().await.wrap_err("Failed to commit transfers")?;
        Ok(())
    }

    async fn load_cursor(&self, chain: Chain) -> Result<Option<BlockRef>> {
        get_cursor(&self.pool, chain).await
    }

    async fn save_cursor(&self, chain: Chain, cursor: BlockRef) -> Result<()> {
        update_cursor(&self.pool, chain, cursor).await
    }
}
