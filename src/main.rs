use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use reviewdesk::config::Config;
use reviewdesk::db::Database;
use reviewdesk::state::AppState;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    })?;

    // Initialize the database
    let db = Database::new(&config.database_path).map_err(to_io)?;
    db.create_schema().await.map_err(to_io)?;
    info!("Schema created successfully!");

    // Heal any helpful_count drift left by earlier runs
    match db.reconcile_helpful_counts().await {
        Ok(0) => {}
        Ok(fixed) => info!("Reconciled helpful counts on {} reviews", fixed),
        Err(e) => error!("Helpful count reconciliation failed: {}", e),
    }

    std::fs::create_dir_all(&config.media_dir)?;

    let addr = config.bind_address();
    let state = web::Data::new(AppState::new(db, config));
    info!("listening on http://{}", &addr);

    // Start the Actix Web server
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .configure(reviewdesk::configure_app(state.clone()))
            .service(web::resource("/").route(web::get().to(index)))
    })
    .bind(&addr)?
    .run()
    .await
}

// Define the index handler
async fn index() -> HttpResponse {
    HttpResponse::Ok().body("reviewdesk is running")
}

fn to_io(e: rusqlite::Error) -> std::io::Error {
    error!("Database error: {}", e);
    std::io::Error::new(std::io::ErrorKind::Other, e)
}
