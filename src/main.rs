use anyhow::{Context, Result};
use oracle_consensus_engine::core::logging::init_logging;
use oracle_consensus_engine::engine::{seed_ledger, EpochEngine, EpochInput, EpochReport};
use oracle_consensus_engine::synthesis::NetworkInferences;
use oracle_consensus_engine::{Config, InMemoryLedger};
use serde::Serialize;
use std::fs;

#[derive(Serialize)]
struct Output {
    network_inferences: NetworkInferences,
    reputer_cycle: Option<EpochReport>,
}

fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(&config.runtime.log_level);

    tracing::info!("oracle consensus engine v{}", env!("CARGO_PKG_VERSION"));

    let path = std::env::args()
        .nth(1)
        .or_else(|| config.runtime.epoch_input_path.clone())
        .context("no epoch input: pass a path or set EPOCH_INPUT_PATH")?;
    let raw = fs::read_to_string(&path).with_context(|| format!("reading epoch input {}", path))?;
    let input: EpochInput = serde_json::from_str(&raw).with_context(|| format!("parsing epoch input {}", path))?;

    let mut ledger = InMemoryLedger::new();
    seed_ledger(&mut ledger, &input).context("seeding ledger")?;
    let mut engine = EpochEngine::new(&mut ledger, config.topic.clone()).context("invalid topic parameters")?;

    // The reputer round stores the combined loss the synthesis reads.
    let reputer_cycle = if input.reputer_bundles.is_empty() {
        tracing::info!(topic_id = input.topic_id, "no reputer bundles, skipping reputer cycle");
        None
    } else {
        Some(
            engine
                .run_reputer_cycle(input.topic_id, input.block_height, input.reputer_bundles.clone())
                .context("reputer cycle failed")?,
        )
    };
    let network_inferences = engine
        .run_inference_synthesis(
            input.topic_id,
            input.block_height,
            input.inferences.clone(),
            input.forecasts.clone(),
        )
        .context("inference synthesis failed")?;

    let output = Output {
        network_inferences,
        reputer_cycle,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
