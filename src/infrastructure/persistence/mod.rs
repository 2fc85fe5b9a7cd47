mod database;
mod repositories;

pub use database::Database;
pub use repositories::{
    CachedParameterStore, SqliteCandleStore, SqliteParameterStore, SqlitePositionStore,
    SqliteSimulationTaskStore, SqliteTradeJournal, SqliteUserRegistry,
};
