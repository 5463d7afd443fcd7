//! Token mapping between chain A and chain B
//!
//! The mapping is assembled once at startup from deployment records and
//! configuration, then shared read-only with the engine.

use alloy::primitives::Address;
use std::collections::HashMap;

use crate::types::Direction;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("token {token} on chain a is already mapped to {existing}")]
    ConflictingA { token: Address, existing: Address },
    #[error("token {token} on chain b is already mapped to {existing}")]
    ConflictingB { token: Address, existing: Address },
}

/// Append-only bidirectional association A token ↔ B token
#[derive(Debug, Clone, Default)]
pub struct TokenMapping {
    a_to_b: HashMap<Address, Address>,
    b_to_a: HashMap<Address, Address>,
}

impl TokenMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair. Re-inserting an identical pair is a no-op; remapping either
    /// side to a different token is rejected.
    pub fn insert(&mut self, a_token: Address, b_token: Address) -> Result<(), MappingError> {
        if let Some(existing) = self.a_to_b.get(&a_token) {
            if *existing != b_token {
                return Err(MappingError::ConflictingA {
                    token: a_token,
                    existing: *existing,
                });
            }
        }
        if let Some(existing) = self.b_to_a.get(&b_token) {
            if *existing != a_token {
                return Err(MappingError::ConflictingB {
                    token: b_token,
                    existing: *existing,
                });
            }
        }
        self.a_to_b.insert(a_token, b_token);
        self.b_to_a.insert(b_token, a_token);
        Ok(())
    }

    /// Destination token for a transfer whose origin token is `origin_token`
    pub fn destination_for(&self, direction: Direction, origin_token: &Address) -> Option<Address> {
        match direction {
            Direction::DepositAtoB => self.a_to_b.get(origin_token).copied(),
            Direction::WithdrawalBtoA => self.b_to_a.get(origin_token).copied(),
        }
    }

    pub fn len(&self) -> usize {
        self.a_to_b.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a_to_b.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&Address, &Address)> {
        self.a_to_b.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    const A_TOKEN: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const B_TOKEN: Address = address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

    #[test]
    fn test_lookup_both_directions() {
        let mut mapping = TokenMapping::new();
        mapping.insert(A_TOKEN, B_TOKEN).unwrap();

        assert_eq!(
            mapping.destination_for(Direction::DepositAtoB, &A_TOKEN),
            Some(B_TOKEN)
        );
        assert_eq!(
            mapping.destination_for(Direction::WithdrawalBtoA, &B_TOKEN),
            Some(A_TOKEN)
        );
        assert_eq!(mapping.destination_for(Direction::DepositAtoB, &B_TOKEN), None);
    }

    #[test]
    fn test_reinsert_same_pair_is_noop() {
        let mut mapping = TokenMapping::new();
        mapping.insert(A_TOKEN, B_TOKEN).unwrap();
        mapping.insert(A_TOKEN, B_TOKEN).unwrap();
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_remap_is_rejected() {
        let other = address!("cccccccccccccccccccccccccccccccccccccccc");
        let mut mapping = TokenMapping::new();
        mapping.insert(A_TOKEN, B_TOKEN).unwrap();

        assert!(matches!(
            mapping.insert(A_TOKEN, other),
            Err(MappingError::ConflictingA { .. })
        ));
        assert!(matches!(
            mapping.insert(other, B_TOKEN),
            Err(MappingError::ConflictingB { .. })
        ));
        assert_eq!(
            mapping.destination_for(Direction::DepositAtoB, &A_TOKEN),
            Some(B_TOKEN)
        );
    }
}
