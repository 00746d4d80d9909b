//! Omnichannel clinic messaging API
//!
//! (c) Softlandia 2025

use clinic_omnichannel_api::api;
use clinic_omnichannel_api::config::AppConfig;
use clinic_omnichannel_api::core::sequencer::AppendSequencer;
use clinic_omnichannel_api::core::services::{
    MyConversationService, MyMessageService, MyProfileService,
};
use clinic_omnichannel_api::core::subscriptions::SubscriptionRegistry;
use clinic_omnichannel_api::infrastructure::changes::ChangeFeed;
use clinic_omnichannel_api::infrastructure::database::DatabaseConnection;
use clinic_omnichannel_api::infrastructure::repositories::{
    DbConversationRepository, DbMessageRepository, DbProfileRepository,
};

use anyhow::{Context, anyhow};
use axum::Router;
use axum::http::{HeaderValue, Method};
use di::{Injectable, ServiceCollection};
use di_axum::RouterServiceProviderExtensions;
use log::info;
use tokio::runtime::{Builder, Runtime};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env()?;

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(web_server_task(config))
}

async fn web_server_task(config: AppConfig) -> anyhow::Result<()> {
    let provider = ServiceCollection::new()
        .add(DatabaseConnection::singleton())
        .add(ChangeFeed::singleton())
        .add(SubscriptionRegistry::singleton())
        .add(AppendSequencer::singleton())
        .add(DbProfileRepository::scoped())
        .add(DbConversationRepository::scoped())
        .add(DbMessageRepository::scoped())
        .add(MyProfileService::scoped())
        .add(MyConversationService::scoped())
        .add(MyMessageService::scoped())
        .build_provider()
        .map_err(|err| anyhow!("invalid service registrations: {err}"))?;

    provider
        .get_required::<DatabaseConnection>()
        .migrate()
        .await
        .context("failed to migrate the database")?;

    // start relaying store changes before the first request arrives
    provider.get_required::<SubscriptionRegistry>();

    let origins = config
        .allowed_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()
        .context("ALLOWED_ORIGINS contains an invalid origin")?;

    let app = Router::new()
        .nest("/profiles", api::profiles::router())
        .nest("/conversations", api::conversations::router())
        .nest("/messages", api::messages::router())
        .layer(
            ServiceBuilder::new().layer(
                CorsLayer::new()
                    .allow_headers(Any)
                    .allow_methods([Method::GET, Method::POST, Method::PUT])
                    .allow_origin(origins),
            ),
        )
        .with_provider(provider);

    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    info!("Shutting down...");

    Ok(())
}
