use anyhow::{Context, Result};
use chrono::Utc;

use crate::config::Settings;
use crate::util::{codec, connect};

pub async fn run(settings: &Settings) -> Result<()> {
    let store = connect(settings).await?;
    let codec = codec(settings)?;
    let mut sessions = dp_session::list_sessions(store.as_ref(), codec.as_ref(), settings.scope())
        .await
        .context("failed to list sessions")?;

    if sessions.is_empty() {
        println!("No sessions under scope '{}'.", settings.scope());
        return Ok(());
    }
    sessions.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));

    let now = Utc::now();
    for d in sessions {
        let state = if d.is_expired_at(now) {
            "expired".to_string()
        } else {
            d.status.to_string()
        };
        println!(
            "{}/{}  step {}/{}  {}  {}  last access {}",
            d.user_id,
            d.dataset_id,
            d.current_step,
            d.total_operations,
            d.current_shape,
            state,
            d.last_accessed.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
