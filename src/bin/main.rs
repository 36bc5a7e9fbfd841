use chrono::Utc;
use quitador::classifier::{IntentClassifier, KeywordClassifier};
use quitador::fsm::TurnHandler;
use quitador::renderer::{ResponseRenderer, TemplateRenderer};
use quitador::repository::{sample_bills, InMemoryBillRepository};
use quitador::session::SessionRegistry;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    dotenv::dotenv().ok();

    // Low enough that the sample bills force a shortfall decision.
    let opening_balance: f64 = std::env::var("OPENING_BALANCE")
        .unwrap_or_else(|_| "5000.0".to_string())
        .parse()?;

    info!("Payment agent demo starting (balance {})", opening_balance);

    let today = Utc::now().date_naive();
    let repository = InMemoryBillRepository::new();
    repository.insert_all("demo-company", sample_bills(today)).await;

    let handler = TurnHandler::new(
        Arc::new(repository),
        Arc::new(SessionRegistry::new(opening_balance)),
        "demo-company",
    )
    .with_today(today);

    let classifier = KeywordClassifier::with_today(today);
    let renderer = TemplateRenderer;
    let session_id = Uuid::new_v4();

    // A scripted conversation exercising the whole loop: overview,
    // details, financing comparison, confirmation, commit, re-query.
    let script = [
        "hello!",
        "show me today's payments",
        "tell me more about these bills",
        "BOL003",
        "what financing options do I have?",
        "yes, go ahead",
        "show me today's payments",
        "any overdue bills left?",
        "help",
    ];

    for message in script {
        println!("\n>>> {}", message);

        let session = handler.sessions().get_or_create(session_id).await;
        let state = session.lock().await.state();

        let classification = classifier.classify(message, state)?;
        let (context, _next) = handler
            .handle_turn(session_id, classification.intent, classification.params)
            .await?;

        let reply = renderer.render(&context).await?;
        println!("{}", reply);
    }

    Ok(())
}
