use anyhow::{Context, Result};

use crate::config::Settings;
use crate::util::{codec, connect};

pub async fn run(settings: &Settings) -> Result<()> {
    let store = connect(settings).await?;
    let codec = codec(settings)?;
    let purged = dp_session::sweep_expired(&store, &codec, settings.scope())
        .await
        .context("sweep failed")?;

    for keys in &purged {
        println!("purged {}/{}", keys.user_id(), keys.dataset_id());
    }
    println!("{} expired session(s) removed.", purged.len());
    Ok(())
}
