pub mod crypto;
pub mod http_client;
pub mod memory;
pub mod persistence;
pub mod rate_limit;
pub mod upbit;
