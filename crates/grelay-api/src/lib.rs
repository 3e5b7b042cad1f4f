//! ---
//! grelay_section: "05-networking-external-interfaces"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "HTTP trigger for the greeting producer."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---

use std::fmt;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use grelay_metrics::{metrics_router, SharedRegistry};
use grelay_msg::{InvocationContext, Producer};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Shared state for the greeting handlers.
pub struct ApiState {
    producer: Producer,
    environment: &'static str,
}

impl ApiState {
    pub fn new(producer: Producer, environment: &'static str) -> Self {
        Self {
            producer,
            environment,
        }
    }
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState")
            .field("environment", &self.environment)
            .field("topic", self.producer.topic())
            .finish_non_exhaustive()
    }
}

/// Build the HTTP router: the greeting route at `resource_path`, `/healthz`,
/// and `/metrics` when a registry is supplied.
pub fn router(
    state: Arc<ApiState>,
    resource_path: &str,
    registry: Option<SharedRegistry>,
) -> Router {
    let routes = Router::new()
        .route(resource_path, get(get_greeting))
        .route("/healthz", get(get_health))
        .with_state(state);
    let routes = match registry {
        Some(registry) => routes.merge(metrics_router(registry)),
        None => routes,
    };
    routes.layer(TraceLayer::new_for_http())
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Bind `addr` and serve `router` until [`ApiServer::shutdown`] is called.
pub fn spawn_api_server(router: Router, addr: SocketAddr) -> Result<ApiServer> {
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let addr = listener.local_addr().context("failed to read bound address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        if let Err(err) = axum::serve(
            tcp_listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await
        {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    environment: &'static str,
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        environment: state.environment,
    })
}

async fn get_greeting(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let origin = forwarded_origin(&headers)
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()));
    let context = match origin {
        Some(origin) => InvocationContext::with_origin(origin),
        None => InvocationContext::anonymous(),
    };
    let response = state.producer.handle(context).await;
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);
    (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )],
        response.body,
    )
        .into_response()
}

/// First hop of `X-Forwarded-For`, i.e. the original client.
fn forwarded_origin(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|hop| !hop.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use grelay_msg::{
        DurableQueue, FixedGenerator, GreetingBody, InMemoryTopics, Publisher, TopicHandle,
    };
    use tower::ServiceExt;

    use super::*;

    fn app(topics: &InMemoryTopics) -> Router {
        let producer = Producer::new(
            Arc::new(FixedGenerator("Ave.".into())),
            Publisher::new(Arc::new(topics.clone())),
            TopicHandle::new("greetings"),
        );
        router(
            Arc::new(ApiState::new(producer, "staging")),
            "/greeting",
            Some(grelay_metrics::new_registry()),
        )
    }

    async fn body_of(response: Response) -> GreetingBody {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn greeting_uses_the_first_forwarded_hop() {
        let topics = InMemoryTopics::new();
        let queue = DurableQueue::new("q", Duration::from_secs(30));
        topics.subscribe(&TopicHandle::new("greetings"), queue.clone());

        let response = app(&topics)
            .oneshot(
                Request::get("/greeting")
                    .header("X-Forwarded-For", "203.0.113.5, 10.0.0.1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_of(response).await;
        assert_eq!(body.message, "Ave.");
        assert_eq!(body.ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(
            queue.receive(1)[0].body,
            "Greeting: Ave. || Visitor IP: 203.0.113.5"
        );
    }

    #[tokio::test]
    async fn greeting_succeeds_when_publishing_fails() {
        // no topic declared, so every publish is rejected
        let topics = InMemoryTopics::new();
        let response = app(&topics)
            .oneshot(Request::get("/greeting").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_of(response).await;
        assert_eq!(body.ip, None);
    }

    #[tokio::test]
    async fn health_and_metrics_are_served() {
        let app = app(&InMemoryTopics::new());
        let health = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(health.status(), StatusCode::OK);
        let metrics = app
            .oneshot(Request::get("/metrics").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(metrics.status(), StatusCode::OK);
    }

    #[test]
    fn forwarded_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_origin(&headers), None);
        headers.insert(FORWARDED_FOR, HeaderValue::from_static(" , 198.51.100.2"));
        assert_eq!(forwarded_origin(&headers).as_deref(), Some("198.51.100.2"));
    }
}
