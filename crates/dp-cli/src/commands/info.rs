use anyhow::{Context, Result};

use crate::config::Settings;
use crate::util::open_session;

pub async fn run(settings: &Settings, user: &str, dataset: &str) -> Result<()> {
    let session = open_session(settings, user, dataset).await?;
    let info = session
        .get_session_info()
        .await
        .context("failed to read session info")?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
