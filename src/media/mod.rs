pub mod heartbeat;
pub mod pipeline;
pub mod source;
pub mod stack;
pub mod tiers;
pub mod types;
pub mod workers;
