use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State as AxumState},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
    },
    routing::{get, post},
};
use futures_util::{
    StreamExt,
    stream::{self, BoxStream},
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{ApiError, ApiServer, ContainerView, CreateQuery, UserId};
use crate::lib::{
    channel::types::{Status, StatusMessage, Subscription},
    service::types::{ContainerService, CreationStatus},
};

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

fn message_event(data: String) -> Event {
    Event::default().event("message").data(data)
}

/// Forwards every channel message as an SSE event until the channel closes.
fn channel_events(subscription: Subscription) -> EventStream {
    stream::unfold(subscription, |mut subscription| async move {
        let message = subscription.recv().await?;
        Some((Ok(message_event(message)), subscription))
    })
    .boxed()
}

/// One `Running` event, then the stream stays open for `hold` and ends.
fn settled_events(hold: std::time::Duration) -> EventStream {
    let running = message_event(StatusMessage::new(Status::Running).encode());
    stream::once(async move { Ok::<_, Infallible>(running) })
        .chain(
            stream::once(tokio::time::sleep(hold))
                .filter_map(|_| async { None::<Result<Event, Infallible>> }),
        )
        .boxed()
}

fn sse(events: EventStream) -> Sse<KeepAliveStream<EventStream>> {
    Sse::new(events).keep_alive(KeepAlive::default())
}

impl ApiServer {
    pub fn new(service: Arc<ContainerService>, listen: &str) -> Self {
        Self {
            service,
            listen: listen.to_string(),
        }
    }

    async fn health() -> impl IntoResponse {
        Json(json!({ "status": "ok" }))
    }

    async fn create_container(
        AxumState(service): AxumState<Arc<ContainerService>>,
        UserId(user_id): UserId,
        Query(query): Query<CreateQuery>,
    ) -> Result<impl IntoResponse, ApiError> {
        service.create_container(user_id, query.template_id).await?;
        Ok(Json(json!({ "message": "container creation started" })))
    }

    async fn container_status(
        AxumState(service): AxumState<Arc<ContainerService>>,
        UserId(user_id): UserId,
        Path(template_id): Path<u64>,
    ) -> Result<impl IntoResponse, ApiError> {
        let events = match service.creation_status(user_id, template_id).await? {
            CreationStatus::Live(subscription) => channel_events(subscription),
            CreationStatus::Settled(instance) => {
                debug!("no live channel for instance {}, replaying running", instance.id);
                settled_events(service.config().fallback_hold)
            }
        };
        Ok(sse(events))
    }

    async fn get_container(
        AxumState(service): AxumState<Arc<ContainerService>>,
        UserId(user_id): UserId,
        Path(template_id): Path<u64>,
    ) -> Result<impl IntoResponse, ApiError> {
        let container = service.get_container(user_id, template_id).await?;
        let access_url = service.access_url(&container);
        Ok(Json(ContainerView {
            container,
            access_url,
        }))
    }

    async fn check_container(
        AxumState(service): AxumState<Arc<ContainerService>>,
        UserId(user_id): UserId,
        Path(template_id): Path<u64>,
    ) -> Result<impl IntoResponse, ApiError> {
        let subscription = service.check_container(user_id, template_id).await?;
        Ok(sse(channel_events(subscription)))
    }

    pub fn router(service: Arc<ContainerService>) -> Router {
        Router::new()
            .route("/health", get(ApiServer::health))
            .route("/containers", post(ApiServer::create_container))
            .route("/containers/{template_id}", get(ApiServer::get_container))
            .route("/containers/{template_id}/status", get(ApiServer::container_status))
            .route("/containers/{template_id}/check", post(ApiServer::check_container))
            .with_state(service)
    }

    pub async fn start_server(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let app = ApiServer::router(self.service);
        let listener = TcpListener::bind(&self.listen).await?;
        info!("listening on {}", self.listen);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}
