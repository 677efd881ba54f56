//! Service reviews backend: accounts, a review ledger with helpful votes,
//! per-service summaries and a feedback log, served over actix-web and
//! stored in SQLite.

pub mod accounts;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod media;
pub mod models;
pub mod state;

use actix_files::Files;
use actix_web::web;

use crate::state::AppState;

/// Room above the upload limit so oversized pictures still reach the
/// handler and get a field error instead of a bare 413.
const UPLOAD_SLACK_BYTES: usize = 1024 * 1024;

/// Everything the HTTP app needs: shared state, the `/api` routes and the
/// media file service.
pub fn configure_app(state: web::Data<AppState>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg: &mut web::ServiceConfig| {
        let upload_limit = state
            .config
            .max_upload_bytes
            .saturating_add(UPLOAD_SLACK_BYTES);
        let media_url = state.config.media_url.clone();
        let media_dir = state.config.media_dir.clone();

        cfg.app_data(state)
            .app_data(web::PayloadConfig::new(upload_limit))
            .service(web::scope("/api").configure(api::configure));

        // Remote media URLs are served by someone else
        if media_url.starts_with('/') {
            cfg.service(Files::new(&media_url, media_dir));
        }
    }
}
