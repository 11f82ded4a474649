//! Four-worker analytics pipeline using ensemble as a library.
//!
//! Plans the request across data analyst, visualization, prediction, and
//! report workers, then prints the synthesized insights.
//!
//! ```bash
//! export ANTHROPIC_API_KEY="sk-..."
//! cargo run -p ensemble --example analytics_pipeline -- "How did sales develop last quarter?"
//! ```

use std::sync::Arc;

use ensemble::{Orchestrator, AnthropicProvider, TracingHooks, WorkerKind, WorkerSpec};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ensemble=info".into()),
        )
        .init();

    // 1. Create an oracle provider from an API key.
    let api_key =
        std::env::var("ANTHROPIC_API_KEY").expect("set ANTHROPIC_API_KEY environment variable");
    let provider = Arc::new(AnthropicProvider::new(&api_key, "claude-sonnet-4-20250514"));

    // 2. Declare the worker roster and build the orchestrator.
    let orchestrator = Orchestrator::builder(provider)
        .worker(WorkerSpec::new(
            WorkerKind::DataAnalyst,
            "You are a data analyst. Summarize the relevant data for the task \
             and state concrete figures where possible.",
        ))
        .worker(WorkerSpec::new(
            WorkerKind::Visualization,
            "You describe the charts that best communicate the analyzed data.",
        ))
        .worker(WorkerSpec::new(
            WorkerKind::Prediction,
            "You produce a short forecast grounded in the analyzed data.",
        ))
        .worker(WorkerSpec::new(
            WorkerKind::Report,
            "You compose upstream findings into a concise report.",
        ))
        .hooks(Arc::new(TracingHooks))
        .build()?;

    // 3. Get the request from CLI args or use a default.
    let request = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "How did sales develop last quarter?".into());

    // 4. Run and print the synthesized answer.
    let result = orchestrator.analyze(&request).await?;

    println!("status: {:?}", result.status());
    println!("confidence: {:.2}", result.confidence_score);
    if let Some(disclaimer) = &result.grounding_disclaimer {
        println!("note: {disclaimer}");
    }
    println!("\ninsights:");
    for insight in &result.final_insights {
        println!("  - {insight}");
    }
    println!("\nrecommendations:");
    for recommendation in &result.recommendations {
        println!("  - {recommendation}");
    }

    Ok(())
}
