pub mod advertiser;
pub mod behaviour;
pub mod config;
pub mod dht;
pub mod discovery;
pub mod health;
pub mod identity;
pub mod metadata;
pub mod nat;
pub mod node;
pub mod protocol;
pub mod traits;
pub mod types;

#[cfg(test)]
pub mod test_utils;
