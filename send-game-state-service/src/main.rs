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

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_apigatewaymanagement::{
    Client as GatewayClient,
    error::{DisplayErrorContext, SdkError},
    operation::post_to_connection::PostToConnectionError,
    primitives::Blob,
};
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{Extensions, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use chrono::Utc;
use game_state_common::{
    BroadcastRequest, BroadcastSummary, CONNECTION_ID_ATTRIBUTE, ConnectionId, DATA_SENT_BODY,
    DEFAULT_FANOUT_CONCURRENCY, DEFAULT_GAME_ID, EXPIRES_ATTRIBUTE, FanOutFailure,
    GAME_ID_ATTRIBUTE, GAME_STATE_ATTRIBUTE, GameStateRecord, GatewayEndpoint, PushOutcome,
    RequestError, fan_out, fold_outcomes,
};
use lambda_http::{request::RequestContext, run as lambda_run};
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct ServiceConfig {
    connections_table_name: String,
    games_table_name: String,
    region: Option<String>,
    dynamodb_endpoint: Option<String>,
    /// Used when the request context carries no domain/stage (local mode).
    gateway_endpoint: Option<GatewayEndpoint>,
    fanout_concurrency: usize,
    bind_addr: SocketAddr,
}

impl ServiceConfig {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let optional = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |name: &str| optional(name).context(format!("{name} must be set"));

        let bind_addr = optional("SEND_GAME_STATE_BIND")
            .unwrap_or_else(|| "0.0.0.0:8085".to_string())
            .parse()
            .context("invalid SEND_GAME_STATE_BIND")?;

        Ok(Self {
            connections_table_name: required("CONNECTIONS_TABLE_NAME")?,
            games_table_name: required("GAMES_TABLE_NAME")?,
            region: optional("AWS_REGION"),
            dynamodb_endpoint: optional("DYNAMODB_ENDPOINT"),
            gateway_endpoint: optional("GATEWAY_ENDPOINT")
                .and_then(|value| GatewayEndpoint::parse(&value)),
            fanout_concurrency: optional("FANOUT_CONCURRENCY")
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(DEFAULT_FANOUT_CONCURRENCY)
                .max(1),
            bind_addr,
        })
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServiceConfig>,
    connections: Arc<dyn ConnectionStore>,
    game_states: Arc<dyn GameStateStore>,
    gateway: Arc<dyn ConnectionGateway>,
}

impl AppState {
    async fn from_config(config: ServiceConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = config.region.clone() {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;

        let mut dynamo_config = aws_sdk_dynamodb::config::Builder::from(&sdk_config);
        if let Some(endpoint) = config.dynamodb_endpoint.as_ref() {
            dynamo_config = dynamo_config.endpoint_url(endpoint);
        }
        let dynamo = DynamoClient::from_conf(dynamo_config.build());

        info!(
            connections_table = %config.connections_table_name,
            games_table = %config.games_table_name,
            fanout_concurrency = config.fanout_concurrency,
            "send-game-state stores configured"
        );

        Self {
            connections: Arc::new(DynamoConnectionStore {
                client: dynamo.clone(),
                table_name: config.connections_table_name.clone(),
            }),
            game_states: Arc::new(DynamoGameStateStore {
                client: dynamo,
                table_name: config.games_table_name.clone(),
            }),
            gateway: Arc::new(ApiGatewayConnectionGateway::new(sdk_config)),
            config: Arc::new(config),
        }
    }
}

#[async_trait]
trait ConnectionStore: Send + Sync {
    async fn list_connection_ids(&self) -> anyhow::Result<Vec<ConnectionId>>;
    async fn delete_connection(&self, connection_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
trait GameStateStore: Send + Sync {
    async fn put_game_state(&self, record: &GameStateRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
enum PushError {
    #[error("connection is gone")]
    Gone,
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
trait ConnectionGateway: Send + Sync {
    async fn post_to_connection(
        &self,
        endpoint: &GatewayEndpoint,
        connection_id: &str,
        payload: &[u8],
    ) -> Result<(), PushError>;
}

struct DynamoConnectionStore {
    client: DynamoClient,
    table_name: String,
}

#[async_trait]
impl ConnectionStore for DynamoConnectionStore {
    async fn list_connection_ids(&self) -> anyhow::Result<Vec<ConnectionId>> {
        let mut connection_ids = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table_name)
                .projection_expression(CONNECTION_ID_ATTRIBUTE)
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .context(format!("failed to scan {} table", self.table_name))?;

            connection_ids.extend(output.items().iter().filter_map(|item| {
                item.get(CONNECTION_ID_ATTRIBUTE)
                    .and_then(|value| value.as_s().ok())
                    .cloned()
            }));

            start_key = output.last_evaluated_key().cloned();
            if start_key.is_none() {
                break;
            }
        }
        Ok(connection_ids)
    }

    async fn delete_connection(&self, connection_id: &str) -> anyhow::Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key(
                CONNECTION_ID_ATTRIBUTE,
                AttributeValue::S(connection_id.to_string()),
            )
            .send()
            .await
            .context(format!(
                "failed to delete connection {connection_id} from {} table",
                self.table_name
            ))?;
        Ok(())
    }
}

struct DynamoGameStateStore {
    client: DynamoClient,
    table_name: String,
}

#[async_trait]
impl GameStateStore for DynamoGameStateStore {
    async fn put_game_state(&self, record: &GameStateRecord) -> anyhow::Result<()> {
        let mut item = HashMap::new();
        item.insert(
            GAME_ID_ATTRIBUTE.to_string(),
            AttributeValue::S(record.game_id.clone()),
        );
        item.insert(
            GAME_STATE_ATTRIBUTE.to_string(),
            AttributeValue::S(record.state.clone()),
        );
        item.insert(
            EXPIRES_ATTRIBUTE.to_string(),
            AttributeValue::N(record.expires.to_string()),
        );

        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item))
            .send()
            .await
            .context(format!("failed to put item into {} table", self.table_name))?;
        Ok(())
    }
}

/// Posts to the API Gateway management API. Only the client for the most
/// recent endpoint is kept; a different endpoint replaces it.
struct ApiGatewayConnectionGateway {
    sdk_config: SdkConfig,
    client: tokio::sync::Mutex<Option<(GatewayEndpoint, GatewayClient)>>,
}

impl ApiGatewayConnectionGateway {
    fn new(sdk_config: SdkConfig) -> Self {
        Self {
            sdk_config,
            client: tokio::sync::Mutex::new(None),
        }
    }

    async fn client_for(&self, endpoint: &GatewayEndpoint) -> GatewayClient {
        let mut slot = self.client.lock().await;
        if let Some((cached_endpoint, client)) = slot.as_ref()
            && cached_endpoint == endpoint
        {
            return client.clone();
        }

        debug!(endpoint = %endpoint, "creating gateway management client");
        let config = aws_sdk_apigatewaymanagement::config::Builder::from(&self.sdk_config)
            .endpoint_url(endpoint.url())
            .build();
        let client = GatewayClient::from_conf(config);
        *slot = Some((endpoint.clone(), client.clone()));
        client
    }
}

fn is_gone(error: &SdkError<PostToConnectionError>) -> bool {
    matches!(
        error.as_service_error(),
        Some(PostToConnectionError::GoneException(_))
    ) || error
        .raw_response()
        .is_some_and(|response| response.status().as_u16() == 410)
}

#[async_trait]
impl ConnectionGateway for ApiGatewayConnectionGateway {
    async fn post_to_connection(
        &self,
        endpoint: &GatewayEndpoint,
        connection_id: &str,
        payload: &[u8],
    ) -> Result<(), PushError> {
        let client = self.client_for(endpoint).await;
        match client
            .post_to_connection()
            .connection_id(connection_id)
            .data(Blob::new(payload.to_vec()))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_gone(&error) => Err(PushError::Gone),
            Err(error) => Err(PushError::Failed(DisplayErrorContext(&error).to_string())),
        }
    }
}

#[derive(Debug, Error)]
enum BroadcastError {
    #[error("failed to read open connections: {0}")]
    RosterFetch(String),
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
    #[error("request has no gateway domain/stage and GATEWAY_ENDPOINT is not set")]
    MissingEndpoint,
    #[error("failed to save game state: {0}")]
    StatePersist(String),
    #[error("failed to push game state to {0}")]
    Push(#[from] FanOutFailure),
}

impl BroadcastError {
    fn kind(&self) -> &'static str {
        match self {
            Self::RosterFetch(_) => "roster_fetch",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MissingEndpoint => "missing_endpoint",
            Self::StatePersist(_) => "state_persist",
            Self::Push(_) => "push",
        }
    }
}

impl IntoResponse for BroadcastError {
    fn into_response(self) -> Response {
        warn!(kind = self.kind(), error = %self, "game state broadcast failed");
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "send_game_state_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env()?;
    let bind_addr = config.bind_addr;
    let state = AppState::from_config(config).await;

    let lambda_mode = std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok();
    let app = build_router(state, lambda_mode);

    if lambda_mode {
        info!("AWS Lambda runtime detected; running send-game-state-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    info!(%bind_addr, "send-game-state-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// In lambda mode every unmatched request is a broadcast, since WebSocket
/// route events do not carry a meaningful path.
fn build_router(state: AppState, lambda_mode: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/", any(send_game_state_handler))
        .route("/send-game-state", post(send_game_state_handler));
    let router = if lambda_mode {
        router.fallback(send_game_state_handler)
    } else {
        router
    };

    router
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "send-game-state-service"}))
}

async fn send_game_state_handler(
    State(state): State<AppState>,
    extensions: Extensions,
    body: Bytes,
) -> Result<&'static str, BroadcastError> {
    let endpoint = endpoint_from_extensions(&extensions);
    broadcast_game_state(&state, endpoint, &body).await?;
    Ok(DATA_SENT_BODY)
}

fn endpoint_from_extensions(extensions: &Extensions) -> Option<GatewayEndpoint> {
    match extensions.get::<RequestContext>()? {
        RequestContext::WebSocket(context) => GatewayEndpoint::from_request_context(
            context.domain_name.as_deref()?,
            context.stage.as_deref()?,
        ),
        _ => None,
    }
}

async fn broadcast_game_state(
    state: &AppState,
    request_endpoint: Option<GatewayEndpoint>,
    body: &[u8],
) -> Result<BroadcastSummary, BroadcastError> {
    let connection_ids = state
        .connections
        .list_connection_ids()
        .await
        .map_err(|error| BroadcastError::RosterFetch(format!("{error:#}")))?;

    let request = BroadcastRequest::from_body(body)?;

    let record = GameStateRecord::new(DEFAULT_GAME_ID, request.state_json(), Utc::now());
    state
        .game_states
        .put_game_state(&record)
        .await
        .map_err(|error| BroadcastError::StatePersist(format!("{error:#}")))?;

    if connection_ids.is_empty() {
        info!(expires = record.expires, "game state saved; no open connections");
        return Ok(BroadcastSummary::default());
    }

    // Only needed once there is someone to push to.
    let endpoint = request_endpoint
        .or_else(|| state.config.gateway_endpoint.clone())
        .ok_or(BroadcastError::MissingEndpoint)?;

    let payload = request.push_payload();
    let endpoint = &endpoint;
    let payload = payload.as_slice();
    let connection_count = connection_ids.len();
    let outcomes = fan_out(
        connection_ids,
        state.config.fanout_concurrency,
        move |connection_id| push_to_connection(state, endpoint, payload, connection_id),
    )
    .await;
    let summary = fold_outcomes(outcomes)?;

    info!(
        endpoint = %endpoint,
        connections = connection_count,
        delivered = summary.delivered,
        removed = summary.removed,
        expires = record.expires,
        "game state broadcast"
    );
    Ok(summary)
}

async fn push_to_connection(
    state: &AppState,
    endpoint: &GatewayEndpoint,
    payload: &[u8],
    connection_id: ConnectionId,
) -> PushOutcome {
    match state
        .gateway
        .post_to_connection(endpoint, &connection_id, payload)
        .await
    {
        Ok(()) => PushOutcome::Delivered,
        Err(PushError::Gone) => {
            info!(connection_id = %connection_id, "found stale connection, deleting");
            match state.connections.delete_connection(&connection_id).await {
                Ok(()) => PushOutcome::StaleRemoved,
                Err(error) => {
                    PushOutcome::Failed(format!("failed to remove stale connection: {error:#}"))
                }
            }
        }
        Err(PushError::Failed(detail)) => PushOutcome::Failed(detail),
    }
}
