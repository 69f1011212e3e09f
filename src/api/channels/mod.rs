use std::sync::Arc;

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};

use crate::{channel::ChannelError, server::AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub name: String,
    pub subscribers: usize,
}

/// GET /api/channels
/// List every open channel with its subscriber count
pub async fn list_channels(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ChannelSummary>>, ChannelError> {
    let mut channels = Vec::new();
    for name in state.hub.list_channels()? {
        // A channel may close between listing and counting.
        match state.hub.subscriber_count(&name) {
            Ok(subscribers) => channels.push(ChannelSummary { name, subscribers }),
            Err(ChannelError::ChannelNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(Json(channels))
}
