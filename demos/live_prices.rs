use crypto_price_engine::{EngineConfig, EngineEvent, PriceEngine};
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crypto_price_engine=info")),
        )
        .init();

    println!("Crypto Price Engine - live listings");
    println!("===================================");

    // Providers, initial provider and API keys come from PRICE_ENGINE_* and *_API_KEY
    let config = EngineConfig::from_env()?;
    let page_count = (config.listings_limit as usize).div_ceil(config.page_size);
    let engine = PriceEngine::start(config).await?;

    engine.subscribe(|event| {
        match event {
            EngineEvent::ProviderSwitched { .. }
            | EngineEvent::StatusChanged { .. }
            | EngineEvent::PollFailed { .. } => println!("  [event] {}", event),
            _ => {}
        }
        Ok(())
    });

    if let Err(e) = engine.refresh_now().await {
        eprintln!("Initial poll failed: {}. Waiting for the scheduler to retry.", e);
    }

    // Cycle through the pages the way a dashboard would
    for round in 0..6 {
        let page = round % page_count.max(1) + 1;
        let listings = engine.set_page(page).await?;
        let state = engine.poll_state().await;

        println!(
            "\n{:-<60}\nPage {} | provider: {} | status: {:?}",
            "", page, state.active_provider, state.status
        );
        for listing in &listings {
            let history = engine.history(&listing.token_id).await;
            let week_ago = history.points().first().map(|p| p.close);
            println!(
                "{:<8} {:>14.4} {:<4} 24h: {:>7} 7d start: {}",
                listing.symbol,
                listing.price.amount,
                listing.price.currency,
                listing
                    .change_24h_pct
                    .map(|c| format!("{:+.2}%", c))
                    .unwrap_or_else(|| "n/a".to_string()),
                week_ago
                    .map(|c| format!("{:.4}", c))
                    .unwrap_or_else(|| "n/a".to_string()),
            );
        }
        if let Some(error) = state.last_error {
            println!("Last error ({}): {}", error.class, error.message);
        }

        sleep(Duration::from_secs(10)).await;
    }

    for metrics in engine.provider_metrics().await {
        println!(
            "Provider {}: p50={:.0}ms, p99={:.0}ms, success_rate={:.1}%",
            metrics.provider_name,
            metrics.latency_p50_ms,
            metrics.latency_p99_ms,
            metrics.success_rate * 100.0
        );
    }

    engine.stop().await;
    Ok(())
}
