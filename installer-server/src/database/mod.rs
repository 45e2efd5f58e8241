pub mod connection;
pub mod provisioning;
