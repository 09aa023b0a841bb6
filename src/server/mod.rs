//! HTTP endpoint for device workers.
//!
//! Serves the same [`CommandHandler`] as the queue loop, behind the same
//! mutex, so a request arriving over HTTP waits for any queued command that
//! is already running.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::message::{Request, Response, Target};
use crate::transport::http::COMMAND_PATH;
use crate::worker::{CommandHandler, SharedHandler};

/// Health check path.
pub const HEALTH_PATH: &str = "/health";

struct Endpoint<H> {
    target: Target,
    handler: SharedHandler<H>,
}

impl<H> Clone for Endpoint<H> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Build the endpoint router for `target`.
pub fn router<H: CommandHandler + 'static>(target: Target, handler: SharedHandler<H>) -> Router {
    Router::new()
        .route(COMMAND_PATH, post(command::<H>))
        .route(HEALTH_PATH, get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(Endpoint { target, handler })
}

/// Serve `app` until `stop` flips to true. In-flight requests finish first.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // A dropped sender also ends the wait.
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await?;

    info!(%addr, "HTTP endpoint stopped");
    Ok(())
}

async fn command<H: CommandHandler + 'static>(
    State(endpoint): State<Endpoint<H>>,
    body: Bytes,
) -> (StatusCode, Json<Response>) {
    let request = match serde_json::from_slice::<Value>(&body)
        .map_err(|e| e.to_string())
        .and_then(|value| {
            Request::from_wire(endpoint.target.clone(), value).map_err(|e| e.to_string())
        }) {
        Ok(request) => request,
        Err(e) => {
            warn!(target = %endpoint.target, error = %e, "Rejected invalid request body");
            return (StatusCode::BAD_REQUEST, Json(Response::invalid_json()));
        }
    };

    let correlation_id = request.correlation_id.clone();
    debug!(
        target = %endpoint.target,
        %correlation_id,
        command = %request.command_type(),
        "Processing request"
    );
    let response = endpoint.handler.lock().await.handle(request).await;
    debug!(
        target = %endpoint.target,
        %correlation_id,
        ok = response.ok,
        message = %response.message,
        "Request handled"
    );

    (StatusCode::OK, Json(response))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Counter {
        handled: usize,
    }

    #[async_trait]
    impl CommandHandler for Counter {
        async fn handle(&mut self, request: Request) -> Response {
            self.handled += 1;
            Response::reply(&request, true, request.command_type())
                .with_extra("handled", self.handled)
        }
    }

    fn app() -> (Router, SharedHandler<Counter>) {
        let handler = Arc::new(Mutex::new(Counter::default()));
        (router(Target::new("arm"), handler.clone()), handler)
    }

    fn post_body(body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(COMMAND_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_command_answers_with_handler_response() {
        let (app, handler) = app();

        let response = app
            .oneshot(post_body(r#"{"id":"c-1","type":"Run_Lua","file":"a.lua"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = read_json(response).await;
        assert_eq!(body["id"], "c-1");
        assert_eq!(body["ok"], true);
        assert_eq!(body["message"], "run_lua");
        assert_eq!(handler.lock().await.handled, 1);
    }

    #[tokio::test]
    async fn test_missing_id_is_echoed_as_null() {
        let (app, _) = app();
        let response = app.oneshot(post_body(r#"{"type":"ping"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_invalid_body_is_bad_request() {
        for body in ["not json", "[1,2,3]", r#"{"id": 7}"#] {
            let (app, handler) = app();
            let response = app.oneshot(post_body(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");

            let body = read_json(response).await;
            assert_eq!(body["ok"], false);
            assert_eq!(body["message"], "invalid_json");
            assert_eq!(body["id"], Value::Null);
            assert_eq!(handler.lock().await.handled, 0);
        }
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri(HEALTH_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let (app, _) = app();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, app, stop_rx));

        stop_tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
