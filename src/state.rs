use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::identity::{IdentityStore, SqliteIdentityStore};
use crate::media::{LocalMediaStore, MediaStore};

/// Everything a handler needs, shared across actix workers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub identity: Arc<dyn IdentityStore>,
    pub media: Arc<dyn MediaStore>,
    pub config: Config,
}

impl AppState {
    /// Wires the SQLite identity store and the local media store to `db`.
    pub fn new(db: Database, config: Config) -> Self {
        let identity = SqliteIdentityStore::new(db.clone(), config.access_ttl, config.refresh_ttl);
        let media = LocalMediaStore::new(config.media_dir.clone(), &config.media_url);
        Self {
            db,
            identity: Arc::new(identity),
            media: Arc::new(media),
            config,
        }
    }
}
