use anyhow::{Context, Result};
use rewind::Rewind;

/// Print per-type statistics for the configured cache
pub async fn run_stats(rewind: &Rewind, json: bool) -> Result<()> {
    let stats = rewind
        .statistics()
        .await
        .context("Failed to read cache entries")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!();
    print!("{}", stats);
    if stats.total_stale() > 0 {
        println!();
        println!(
            "  {} stale entries can be removed with 'rewind evict-expired'",
            stats.total_stale()
        );
    }
    println!();
    Ok(())
}
