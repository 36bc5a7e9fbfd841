use chrono::Utc;
use quitador::api::start_server;
use quitador::classifier::KeywordClassifier;
use quitador::fsm::TurnHandler;
use quitador::renderer::{LlmRenderer, ResponseRenderer, TemplateRenderer};
use quitador::repository::{sample_bills, InMemoryBillRepository};
use quitador::session::SessionRegistry;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    let opening_balance: f64 = std::env::var("OPENING_BALANCE")
        .unwrap_or_else(|_| "10000.0".to_string())
        .parse()?;

    let company_id =
        std::env::var("COMPANY_ID").unwrap_or_else(|_| "demo-company".to_string());

    info!("Payment agent API server");
    info!("Port: {}", api_port);

    let repository = InMemoryBillRepository::new();
    repository
        .insert_all(&company_id, sample_bills(Utc::now().date_naive()))
        .await;

    let handler = Arc::new(TurnHandler::new(
        Arc::new(repository),
        Arc::new(SessionRegistry::new(opening_balance)),
        company_id,
    ));

    let renderer: Arc<dyn ResponseRenderer> = match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => {
            info!("Renderer: Gemini with template fallback");
            Arc::new(LlmRenderer::new(key))
        }
        _ => {
            info!("Renderer: deterministic template (GEMINI_API_KEY not set)");
            Arc::new(TemplateRenderer)
        }
    };

    start_server(
        handler,
        Arc::new(KeywordClassifier::new()),
        renderer,
        api_port,
    )
    .await
}
