use anyhow::{Context, Result};

use crate::config::Settings;
use crate::util::open_session;

pub async fn run(settings: &Settings, user: &str, dataset: &str) -> Result<()> {
    let session = open_session(settings, user, dataset).await?;
    session
        .clear_session()
        .await
        .with_context(|| format!("failed to clear {user}/{dataset}"))?;
    println!("Cleared session {user}/{dataset}.");
    Ok(())
}
