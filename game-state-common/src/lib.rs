// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{fmt, future::Future};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Key of the single game state record this service maintains.
pub const DEFAULT_GAME_ID: &str = "default";
/// Lifetime of a stored game state before the table expires it.
pub const GAME_STATE_TTL_SECONDS: i64 = 60 * 60;
pub const DEFAULT_FANOUT_CONCURRENCY: usize = 64;
pub const DATA_SENT_BODY: &str = "Data sent.";

pub const CONNECTION_ID_ATTRIBUTE: &str = "connectionId";
pub const GAME_ID_ATTRIBUTE: &str = "gameId";
pub const GAME_STATE_ATTRIBUTE: &str = "gameStateNumAttribute";
pub const EXPIRES_ATTRIBUTE: &str = "expires";

pub type ConnectionId = String;

/// Latest broadcast state, overwritten on every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStateRecord {
    #[serde(rename = "gameId")]
    pub game_id: String,
    #[serde(rename = "gameStateNumAttribute")]
    pub state: String,
    /// Epoch seconds after which the record may be garbage-collected.
    pub expires: i64,
}

impl GameStateRecord {
    pub fn new(
        game_id: impl Into<String>,
        state: impl Into<String>,
        written_at: DateTime<Utc>,
    ) -> Self {
        Self {
            game_id: game_id.into(),
            state: state.into(),
            expires: written_at.timestamp() + GAME_STATE_TTL_SECONDS,
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request body is not a JSON object with a data field: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Inbound broadcast body. `data` is kept as the exact text the sender
/// posted and is never re-serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub data: Box<RawValue>,
}

impl BroadcastRequest {
    pub fn from_body(body: &[u8]) -> Result<Self, RequestError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// JSON text persisted as the game state.
    pub fn state_json(&self) -> String {
        self.data.get().to_string()
    }

    /// Bytes pushed to each connection. A JSON string goes out as its
    /// unescaped content, anything else as the posted JSON text.
    pub fn push_payload(&self) -> Vec<u8> {
        let raw = self.data.get();
        if raw.trim_start().starts_with('"')
            && let Ok(text) = serde_json::from_str::<String>(raw)
        {
            return text.into_bytes();
        }
        raw.as_bytes().to_vec()
    }
}

/// Address of the WebSocket gateway management API, `{domain}/{stage}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GatewayEndpoint(String);

impl GatewayEndpoint {
    pub fn from_request_context(domain_name: &str, stage: &str) -> Option<Self> {
        let domain_name = domain_name.trim().trim_end_matches('/');
        let stage = stage.trim().trim_matches('/');
        if domain_name.is_empty() || stage.is_empty() {
            return None;
        }
        Some(Self(format!("{domain_name}/{stage}")))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let value = raw.trim().trim_end_matches('/');
        if value.is_empty() {
            return None;
        }
        Some(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn url(&self) -> String {
        if self.0.contains("://") {
            self.0.clone()
        } else {
            format!("https://{}", self.0)
        }
    }
}

impl fmt::Display for GatewayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The gateway reported the connection gone and its record was deleted.
    StaleRemoved,
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    pub delivered: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connection {connection_id}: {detail}")]
pub struct FanOutFailure {
    pub connection_id: ConnectionId,
    pub detail: String,
}

/// Runs `push` for every connection with at most `concurrency` in flight.
/// Every unit runs to completion; results come back in roster order.
pub async fn fan_out<F, Fut>(
    connection_ids: Vec<ConnectionId>,
    concurrency: usize,
    push: F,
) -> Vec<(ConnectionId, PushOutcome)>
where
    F: Fn(ConnectionId) -> Fut,
    Fut: Future<Output = PushOutcome>,
{
    stream::iter(connection_ids)
        .map(|connection_id| {
            let unit = push(connection_id.clone());
            async move { (connection_id, unit.await) }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

/// Any failed unit makes the broadcast fail with the first failure in roster order.
pub fn fold_outcomes(
    outcomes: impl IntoIterator<Item = (ConnectionId, PushOutcome)>,
) -> Result<BroadcastSummary, FanOutFailure> {
    let mut summary = BroadcastSummary::default();
    let mut first_failure = None;
    for (connection_id, outcome) in outcomes {
        match outcome {
            PushOutcome::Delivered => summary.delivered += 1,
            PushOutcome::StaleRemoved => summary.removed += 1,
            PushOutcome::Failed(detail) => {
                if first_failure.is_none() {
                    first_failure = Some(FanOutFailure {
                        connection_id,
                        detail,
                    });
                }
            }
        }
    }

    match first_failure {
        Some(failure) => Err(failure),
        None => Ok(summary),
    }
}
