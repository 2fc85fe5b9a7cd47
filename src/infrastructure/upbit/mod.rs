//! REST adapter for the exchange: public market data and the authenticated
//! order surface, with per-request JWT signing and a per-credential token
//! bucket on every authenticated call.

mod auth;
mod execution;
mod market_data;
mod models;

pub use execution::UpbitOrderGateway;
pub use market_data::UpbitMarketData;

pub const DEFAULT_BASE_URL: &str = "https://api.upbit.com";
