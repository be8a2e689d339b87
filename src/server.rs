use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::github::{IssueCommentEvent, PullRequestEvent};
use crate::intake::{Intake, IntakeError, RawEvent};
use crate::store::StoreError;

/// Event type headers, checked in order.
const EVENT_HEADERS: [&str; 2] = ["x-event-type", "x-github-event"];

#[derive(Clone)]
pub struct WebhookState {
    intake: Intake,
    allowed_ips: Arc<Vec<IpAddr>>,
    /// Store failures from spawned intake tasks end the process
    fatal: mpsc::Sender<StoreError>,
}

impl WebhookState {
    pub fn new(intake: Intake, allowed_ips: Vec<IpAddr>, fatal: mpsc::Sender<StoreError>) -> Self {
        Self {
            intake,
            allowed_ips: Arc::new(allowed_ips),
            fatal,
        }
    }
}

pub fn router(state: WebhookState) -> Router {
    Router::new().route("/", post(receive)).with_state(state)
}

pub async fn serve(state: WebhookState, port: u16) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!(port, "listening for webhooks");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

fn event_type(headers: &HeaderMap) -> Option<&str> {
    EVENT_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
}

/// Accept a delivery from an allowed address. The body is handed to intake
/// on its own task; the sender always gets an empty 200 once the event type
/// is known, even when the body does not parse.
async fn receive(
    State(state): State<WebhookState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = peer.ip().to_canonical();
    if !state.allowed_ips.contains(&ip) {
        warn!(%ip, "rejected webhook from unlisted address");
        return StatusCode::FORBIDDEN.into_response();
    }

    let parsed = match event_type(&headers) {
        Some("pull_request") => {
            serde_json::from_slice::<PullRequestEvent>(&body).map(RawEvent::PullRequest)
        }
        Some("issue_comment") => {
            serde_json::from_slice::<IssueCommentEvent>(&body).map(RawEvent::IssueComment)
        }
        other => {
            debug!(event = ?other, "unsupported webhook event");
            return (StatusCode::NOT_IMPLEMENTED, "Unsupported event type").into_response();
        }
    };

    match parsed {
        Ok(event) => {
            let intake = state.intake.clone();
            let fatal = state.fatal.clone();
            tokio::spawn(async move {
                match intake.handle(event).await {
                    Ok(_) => {}
                    Err(IntakeError::Store(err)) => {
                        error!(error = %err, "store failure during webhook intake");
                        let _ = fatal.send(err).await;
                    }
                    Err(err) => warn!(error = %err, "webhook event not processed"),
                }
            });
        }
        Err(err) => warn!(error = %err, "discarding unparseable webhook body"),
    }
    StatusCode::OK.into_response()
}
