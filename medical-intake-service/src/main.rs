use std::sync::Arc;

use graph_flow::{InMemorySessionStorage, PostgresSessionStorage, SessionStorage};
use medical_intake_service::{
    AppState, ConsultationPipeline, build_router,
    config::AppConfig,
    documents::VisionDocumentExtractor,
    llm::OpenRouterClient,
    models::ConversationState,
    policy::ClinicalPolicy,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured JSON tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "medical_intake_service=debug,graph_flow=debug,tower_http=debug".into()
    });

    match log_format.as_str() {
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

async fn create_session_storage(
    database_url: Option<&str>,
) -> Arc<dyn SessionStorage<ConversationState>> {
    let Some(database_url) = database_url else {
        info!("Using in-memory session storage (set DATABASE_URL to use PostgreSQL)");
        return Arc::new(InMemorySessionStorage::<ConversationState>::new());
    };

    info!("Using PostgreSQL session storage");
    match PostgresSessionStorage::<ConversationState>::connect(database_url).await {
        Ok(postgres_storage) => Arc::new(postgres_storage),
        Err(e) => {
            error!(error = %e, "Failed to connect to PostgreSQL, falling back to in-memory storage");
            Arc::new(InMemorySessionStorage::<ConversationState>::new())
        }
    }
}

fn load_policy(path: Option<&str>) -> anyhow::Result<ClinicalPolicy> {
    match path {
        Some(path) => {
            let policy = ClinicalPolicy::load(path)?;
            info!(path = %path, rules = policy.routing_rules.len(), "Loaded clinical policy");
            Ok(policy)
        }
        None => Ok(ClinicalPolicy::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let policy = Arc::new(load_policy(config.clinical_policy_path.as_deref())?);
    let client = Arc::new(OpenRouterClient::new(&config));
    let session_storage = create_session_storage(config.database_url.as_deref()).await;

    let pipeline = Arc::new(ConsultationPipeline::new(
        client.clone(),
        policy,
        session_storage,
        config.heartbeat,
    ));
    let extractor = Arc::new(VisionDocumentExtractor::new(
        client,
        config.ocr_max_pdf_pages,
    ));

    let app = build_router(
        AppState::new(pipeline, extractor).with_upload_limit(config.max_upload_bytes),
    );
    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!(
        addr = %listener.local_addr()?,
        model = %config.model,
        ocr_model = %config.ocr_model,
        "Medical intake service listening"
    );

    axum::serve(listener, app).await?;

    Ok(())
}
