// examples/simulated_provider.rs
//
// Drives the controller against a fake provider that rejects any request above a hidden
// concurrency capacity, and prints what the controller learned after each round.
//
//   RUST_LOG=info,adaptive_rate::stats=debug cargo run --example simulated_provider

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use adaptive_rate_control::{
    ExecutionOptions, RecoveryConfigUpdate, global, run_with_concurrency_limit,
};
use rand::Rng;
use snafu::Snafu;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const PROVIDER: &str = "simulated";
const MODEL: &str = "model-small";
const PRESET_LIMIT: usize = 12;
const HIDDEN_CAPACITY: usize = 4;
const ROUNDS: usize = 8;
const REQUESTS_PER_ROUND: usize = 24;

#[derive(Debug, Snafu)]
enum ProviderError {
    #[snafu(display("HTTP 429 Too Many Requests ({in_flight} in flight)"))]
    Throttled { in_flight: usize },
}

#[derive(Clone, Debug, Default)]
struct SimulatedProvider {
    in_flight: Arc<AtomicUsize>,
}

impl SimulatedProvider {
    async fn complete(&self, prompt: usize) -> Result<usize, ProviderError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let latency = rand::rng().random_range(20..80);
        tokio::time::sleep(Duration::from_millis(latency)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if in_flight > HIDDEN_CAPACITY {
            return ThrottledSnafu { in_flight }.fail();
        }
        Ok(prompt * 2)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    dotenvy::dotenv().ok();

    let default_filter = "info,adaptive_rate::stats=debug";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()?;

    let controller = global::init();
    controller.configure_recovery(
        RecoveryConfigUpdate::builder()
            .recovery_interval(Duration::from_millis(400))
            .build(),
    );
    let provider = SimulatedProvider::default();

    for round in 0..ROUNDS {
        let limit = controller.effective_limit(PROVIDER, MODEL, PRESET_LIMIT);
        let throttled = Arc::new(AtomicUsize::new(0));

        let outcome = run_with_concurrency_limit(
            0..REQUESTS_PER_ROUND,
            limit as f64,
            |prompt, _| {
                let controller = controller.clone();
                let provider = provider.clone();
                let throttled = Arc::clone(&throttled);
                async move {
                    match controller
                        .observe(PROVIDER, MODEL, provider.complete(prompt))
                        .await
                    {
                        Ok(answer) => Ok(Some(answer)),
                        Err(error) => {
                            throttled.fetch_add(1, Ordering::SeqCst);
                            warn!(%error, "Request throttled");
                            Ok::<_, ProviderError>(None)
                        }
                    }
                }
            },
            ExecutionOptions::default(),
        )
        .await?;

        let answered = outcome.iter().flatten().count();
        let summary = controller.combined_summary(PROVIDER, MODEL, PRESET_LIMIT);
        info!(
            round,
            limit,
            answered,
            throttled = throttled.load(Ordering::SeqCst),
            "Round finished"
        );
        println!("{}", serde_json::to_string_pretty(&summary)?);

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    global::shutdown();
    Ok(())
}
