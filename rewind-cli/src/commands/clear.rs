use anyhow::{Context, Result};
use rewind::Rewind;

pub async fn run_clear(rewind: &Rewind, type_name: Option<&str>, stale_only: bool) -> Result<()> {
    let deleted = rewind
        .clear(type_name, stale_only)
        .await
        .context("Failed to clear cache")?;

    let scope = match (type_name, stale_only) {
        (Some(name), true) => format!("stale {} entries", name),
        (Some(name), false) => format!("{} entries", name),
        (None, true) => "stale entries".to_string(),
        (None, false) => "entries".to_string(),
    };
    println!("Deleted {} {}", deleted, scope);
    Ok(())
}

/// Bulk-evict stale entries, then remove partial writes left by crashed
/// processes.
pub async fn run_evict_expired(rewind: &Rewind) -> Result<()> {
    let evicted = rewind
        .evict_expired()
        .await
        .context("Failed to evict expired entries")?;
    let purged = rewind
        .purge_incomplete()
        .await
        .context("Failed to purge partial writes")?;

    println!("Evicted {} expired entries", evicted);
    if purged > 0 {
        println!("Removed {} partial writes", purged);
    }
    Ok(())
}
