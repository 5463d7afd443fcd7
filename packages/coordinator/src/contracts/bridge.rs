//! Bridge contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the lock/mint
//! bridge pair: `L1Bridge` on chain A and `L2Bridge` on chain B.

use alloy::sol;

sol! {
    /// Chain A side: locks deposits, releases finalized withdrawals
    #[sol(rpc)]
    contract L1Bridge {
        /// Emitted when a user locks tokens for bridging to chain B
        event Deposit(
            address indexed user,
            address indexed token,
            uint256 amount,
            uint256 nonce,
            bytes32 depositHash
        );

        /// Applied marker for a released withdrawal
        event WithdrawalFinalized(
            bytes32 indexed withdrawalHash,
            address indexed user,
            address token,
            uint256 amount
        );

        /// Release tokens for a withdrawal initiated on chain B.
        /// Reverts if `withdrawalHash` was already finalized.
        function finalizeWithdrawal(
            address user,
            address token,
            uint256 amount,
            bytes32 withdrawalHash
        ) external;

        function deposit(address token, uint256 amount) external;

        function processedWithdrawals(bytes32 withdrawalHash) external view returns (bool);
    }

    /// Chain B side: mints for deposits, burns on withdrawal
    #[sol(rpc)]
    contract L2Bridge {
        /// Emitted when a user burns wrapped tokens to withdraw to chain A.
        /// Carries the origin nonce, which the transfer hash is derived from;
        /// bridges emitting the nonceless five-field layout are rejected at startup.
        event WithdrawalInitiated(
            address indexed user,
            address indexed l2Token,
            address l1Token,
            uint256 amount,
            uint256 nonce,
            bytes32 withdrawalHash
        );

        /// Applied marker for a processed deposit
        event DepositProcessed(
            bytes32 indexed depositHash,
            address indexed user,
            address l2Token,
            uint256 amount
        );

        /// Mint wrapped tokens for a deposit observed on chain A.
        /// Reverts if `depositHash` was already processed.
        function processDeposit(
            address user,
            address l1Token,
            uint256 amount,
            bytes32 depositHash
        ) external;

        function initiateWithdrawal(address l2Token, uint256 amount) external;

        function setTokenMapping(address l1Token, address l2Token) external;

        function processedDeposits(bytes32 depositHash) external view returns (bool);
    }
}
