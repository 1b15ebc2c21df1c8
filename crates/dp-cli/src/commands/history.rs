use anyhow::{Context, Result};

use crate::config::Settings;
use crate::util::open_session;

pub async fn run(settings: &Settings, user: &str, dataset: &str, n: usize) -> Result<()> {
    let session = open_session(settings, user, dataset).await?;
    let history = session
        .get_history(n)
        .await
        .context("failed to read session history")?;

    if history.is_empty() {
        println!("No history for {user}/{dataset}.");
        return Ok(());
    }
    for entry in history {
        let params = serde_json::to_string(&entry.operation_params)?;
        println!(
            "#{:<4} {}  {:<20} {} -> {}  {}",
            entry.step,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.operation_name,
            entry.shape_before,
            entry.shape_after,
            params
        );
    }
    Ok(())
}
