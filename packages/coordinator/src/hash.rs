//! Hash computation for cross-chain transfer identities
//!
//! The transfer hash is the idempotency key shared by both bridge contracts
//! and the coordinator. It must be reproducible from the transfer fields alone
//! so that recovery after a crash derives exactly the same key.

use alloy::primitives::{Address, B256, U256};
use tiny_keccak::{Hasher, Keccak};

use crate::types::{Direction, Transfer};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Compute the canonical transfer hash
///
/// keccak256(abi.encode(uint8 direction, address user, address originToken, uint256 amount, uint256 nonce))
///
/// All values are encoded as 32-byte words in big-endian format.
pub fn compute_transfer_hash(
    direction: Direction,
    user: &Address,
    origin_token: &Address,
    amount: &U256,
    nonce: &U256,
) -> B256 {
    // abi.encode layout: 5 words * 32 bytes = 160 bytes
    let mut data = [0u8; 160];

    // Word 0: direction (uint8, right-aligned)
    data[31] = direction.as_u8();

    // Word 1: user (address, left-padded to 32 bytes)
    data[32 + 12..64].copy_from_slice(user.as_slice());

    // Word 2: originToken
    data[64 + 12..96].copy_from_slice(origin_token.as_slice());

    // Word 3: amount
    data[96..128].copy_from_slice(&amount.to_be_bytes::<32>());

    // Word 4: nonce
    data[128..160].copy_from_slice(&nonce.to_be_bytes::<32>());

    B256::from(keccak256(&data))
}

/// Re-derive the hash of an existing ledger record
pub fn transfer_hash_of(transfer: &Transfer) -> B256 {
    compute_transfer_hash(
        transfer.direction,
        &transfer.user,
        &transfer.origin_token,
        &transfer.amount,
        &transfer.origin_nonce,
    )
}
