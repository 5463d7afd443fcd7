pub mod bridge;

pub use bridge::{L1Bridge, L2Bridge};
