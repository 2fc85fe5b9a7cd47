use anyhow::Result;
use std::env;

/// `encryption.*` and database keys. The credential-vault secret is only
/// mandatory when live trading is enabled; backtest-only runs work without.
#[derive(Debug, Clone)]
pub struct SecurityEnvConfig {
    pub encryption_secret_key: Option<String>,
    pub database_url: String,
}

impl SecurityEnvConfig {
    pub fn from_env(trading_enabled: bool) -> Result<Self> {
        let encryption_secret_key = env::var("ENCRYPTION_SECRET_KEY").ok();
        if trading_enabled && encryption_secret_key.is_none() {
            anyhow::bail!("ENCRYPTION_SECRET_KEY is required when trading.enabled is set");
        }
        Ok(Self {
            encryption_secret_key,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/autocoin.db".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_optional_when_trading_disabled() {
        let config = SecurityEnvConfig::from_env(false).unwrap();
        assert!(config.database_url.starts_with("sqlite://"));
    }
}
