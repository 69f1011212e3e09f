use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

use crate::{
    channel::{ChannelError, RawSnapshot},
    presence::{PresenceRecord, apply_snapshot},
    server::AppState,
};

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub channel: String,
    /// The table reduced the way clients reduce it: one record per user.
    pub users: Vec<PresenceRecord>,
    /// Every raw row, grouped by presence key.
    pub table: RawSnapshot,
}

/// GET /api/channels/{channel}/presence
/// Get presence information for all users in a channel
pub async fn get_presence(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> Result<Json<PresenceResponse>, ChannelError> {
    let table = state.hub.presence_table(&channel)?;
    let users = apply_snapshot(&table).records().cloned().collect();

    Ok(Json(PresenceResponse {
        channel,
        users,
        table,
    }))
}
