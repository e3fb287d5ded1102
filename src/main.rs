//! Barracks - battalion KPI tracking service

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use barracks::{
    config::Args,
    db::MongoClient,
    notify::{LogMailer, Mailer, SmtpMailer},
    server::{self, AppState},
    store::{EntityStore, InMemoryStore, MongoStore},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("barracks={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Barracks - Battalion KPI Tracker");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("MongoDB: {} (db: {})", args.mongodb_uri, args.mongodb_db);
    info!(
        "SMTP: {}",
        args.smtp.smtp_host.as_deref().unwrap_or("disabled (logging only)")
    );
    info!(
        "Intervals: repair {}s, sweep {}s, reminders {}s, heartbeat {}s",
        args.repair_interval_secs,
        args.sweep_interval_secs,
        args.reminder_interval_secs,
        args.heartbeat_interval_secs
    );
    info!("======================================");

    // MongoDB is required in production; dev mode falls back to memory
    let (store, storage_kind): (Arc<dyn EntityStore>, &'static str) =
        match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
            Ok(client) => {
                info!("MongoDB connected successfully");
                (Arc::new(MongoStore::new(&client).await?), "mongodb")
            }
            Err(e) => {
                if args.dev_mode {
                    warn!("MongoDB connection failed (dev mode, using in-memory store): {}", e);
                    (Arc::new(InMemoryStore::new()), "memory")
                } else {
                    error!("MongoDB connection failed: {}", e);
                    std::process::exit(1);
                }
            }
        };

    let mailer: Arc<dyn Mailer> = match args.smtp_settings() {
        Some(settings) => Arc::new(SmtpMailer::new(&settings)?),
        None => {
            warn!("SMTP_HOST not set, emails will only be logged");
            Arc::new(LogMailer)
        }
    };

    let state = Arc::new(AppState::new(args, store, storage_kind, mailer));
    state.start_background().await;

    tokio::select! {
        result = server::run(Arc::clone(&state)) => {
            if let Err(e) = result {
                error!("Server error: {:?}", e);
                state.stop_background().await;
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    state.stop_background().await;
    info!("Barracks stopped");
    Ok(())
}
