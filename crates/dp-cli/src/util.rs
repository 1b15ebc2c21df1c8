use std::sync::Arc;

use anyhow::{Context, Result};
use dp_session::{CacheStore, JsonCodec, RedisStore, SnapshotCodec, TransformSession};

use crate::config::Settings;

pub async fn connect(settings: &Settings) -> Result<Arc<dyn CacheStore>> {
    let url = settings.require_redis_url()?;
    tracing::debug!(scope = settings.scope(), "connecting to redis");
    let store = RedisStore::new(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    Ok(Arc::new(store))
}

pub fn codec(settings: &Settings) -> Result<Arc<dyn SnapshotCodec>> {
    let codec = JsonCodec::from_config(&settings.session).context("invalid codec settings")?;
    Ok(Arc::new(codec))
}

pub async fn open_session(
    settings: &Settings,
    user: &str,
    dataset: &str,
) -> Result<TransformSession> {
    let store = connect(settings).await?;
    Ok(TransformSession::new(
        store,
        codec(settings)?,
        settings.scope(),
        user,
        dataset,
        settings.session.clone(),
    ))
}
