use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{FailureReason, ReviewFlag, Transfer};

// Amounts are NUMERIC(78,0) in the database. They are bound as decimal text
// and cast in SQL ($n::NUMERIC), and selected back with amount::TEXT.

/// A row of the `transfers` table
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransferRow {
    pub transfer_hash: String,
    pub direction: String,
    pub user_address: String,
    pub origin_token: String,
    pub destination_token: Option<String>,
    pub claimed_destination_token: Option<String>,
    pub amount: String,
    pub origin_nonce: String,
    pub origin_hash: String,
    pub state: String,
    pub origin_confirmed_at: i64,
    pub origin_block_hash: String,
    pub destination_tx: Option<String>,
    pub destination_applied_at: Option<i64>,
    pub challenge_deadline: Option<DateTime<Utc>>,
    /// JSON-encoded [`FailureReason`]
    pub failure: Option<String>,
    /// JSON-encoded [`ReviewFlag`]
    pub review: Option<String>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row of the `chain_cursors` table
#[derive(Debug, Clone, FromRow)]
pub struct CursorRow {
    pub chain: String,
    pub block_number: i64,
    pub block_hash: String,
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| eyre!("{} {} does not fit in BIGINT", field, value))
}

fn parse_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| eyre!("{} {} is negative", field, value))
}

fn parse_address(value: &str, field: &str) -> Result<Address> {
    value
        .parse()
        .wrap_err_with(|| format!("invalid {} '{}'", field, value))
}

fn parse_b256(value: &str, field: &str) -> Result<B256> {
    value
        .parse()
        .wrap_err_with(|| format!("invalid {} '{}'", field, value))
}

fn parse_u256(value: &str, field: &str) -> Result<U256> {
    U256::from_str_radix(value, 10).wrap_err_with(|| format!("invalid {} '{}'", field, value))
}

impl TryFrom<&Transfer> for TransferRow {
    type Error = eyre::Report;

    fn try_from(t: &Transfer) -> Result<Self> {
        Ok(Self {
            transfer_hash: t.transfer_hash.to_string(),
            direction: t.direction.as_str().to_string(),
            user_address: t.user.to_string(),
            origin_token: t.origin_token.to_string(),
            destination_token: t.destination_token.map(|a| a.to_string()),
            claimed_destination_token: t.claimed_destination_token.map(|a| a.to_string()),
            amount: t.amount.to_string(),
            origin_nonce: t.origin_nonce.to_string(),
            origin_hash: t.origin_hash.to_string(),
            state: t.state.as_str().to_string(),
            origin_confirmed_at: to_i64(t.origin_confirmed_at, "origin_confirmed_at")?,
            origin_block_hash: t.origin_block_hash.to_string(),
            destination_tx: t.destination_tx.map(|h| h.to_string()),
            destination_applied_at: t
                .destination_applied_at
                .map(|b| to_i64(b, "destination_applied_at"))
                .transpose()?,
            challenge_deadline: t.challenge_deadline,
            failure: t.failure.as_ref().map(serde_json::to_string).transpose()?,
            review: t.review.as_ref().map(serde_json::to_string).transpose()?,
            attempts: i32::try_from(t.attempts).unwrap_or(i32::MAX),
            created_at: t.created_at,
            updated_at: t.updated_at,
        })
    }
}

impl TryFrom<TransferRow> for Transfer {
    type Error = eyre::Report;

    fn try_from(row: TransferRow) -> Result<Self> {
        let failure: Option<FailureReason> = row
            .failure
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .wrap_err("invalid failure column")?;
        let review: Option<ReviewFlag> = row
            .review
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .wrap_err("invalid review column")?;

        Ok(Transfer {
            transfer_hash: parse_b256(&row.transfer_hash, "transfer_hash")?,
            direction: row.direction.parse()?,
            user: parse_address(&row.user_address, "user_address")?,
            origin_token: parse_address(&row.origin_token, "origin_token")?,
            destination_token: row
                .destination_token
                .as_deref()
                .map(|a| parse_address(a, "destination_token"))
                .transpose()?,
            claimed_destination_token: row
                .claimed_destination_token
                .as_deref()
                .map(|a| parse_address(a, "claimed_destination_token"))
                .transpose()?,
            amount: parse_u256(&row.amount, "amount")?,
            origin_nonce: parse_u256(&row.origin_nonce, "origin_nonce")?,
            origin_hash: parse_b256(&row.origin_hash, "origin_hash")?,
            state: row.state.parse()?,
            origin_confirmed_at: parse_u64(row.origin_confirmed_at, "origin_confirmed_at")?,
            origin_block_hash: parse_b256(&row.origin_block_hash, "origin_block_hash")?,
            destination_tx: row
                .destination_tx
                .as_deref()
                .map(|h| parse_b256(h, "destination_tx"))
                .transpose()?,
            destination_applied_at: row
                .destination_applied_at
                .map(|b| parse_u64(b, "destination_applied_at"))
                .transpose()?,
            challenge_deadline: row.challenge_deadline,
            failure,
            review,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
