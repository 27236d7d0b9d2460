//! HTTP front end for a loaded [`SentimentPipeline`].

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
    model::TrainableClassifier,
    pipeline::SentimentPipeline,
    protocol::{ErrorResponse, HealthResponse, PredictRequest, PredictResponse},
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

pub type AppState = Arc<SentimentPipeline>;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse::new(status.as_u16(), message)))
}

pub fn router(pipeline: AppState) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .with_state(pipeline)
}

async fn health(State(pipeline): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let health = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        architecture: pipeline.model().config().architecture.clone(),
        labels: pipeline.labels(),
    };
    (StatusCode::OK, Json(health))
}

async fn predict(
    State(pipeline): State<AppState>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        debug!(error = %rejection.body_text(), "rejected predict request");
        api_error(rejection.status(), rejection.body_text())
    })?;

    match pipeline.predict(&request.text) {
        Ok(prediction) => Ok(Json(PredictResponse {
            label: prediction.label,
            score: prediction.score,
        })),
        Err(err) => {
            error!(error = %err, "prediction failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
        }
    }
}

/// Binds `addr` and serves until Ctrl-C.
pub async fn run(addr: SocketAddr, pipeline: AppState) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    let local = listener.local_addr().map_err(ServerError::Serve)?;
    info!(addr = %local, "serving sentiment model");

    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ServerError::Serve)?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{
        data::LabelMapping,
        model::{BagOfWordsClassifier, ClassifierConfig},
        tokenizer::{FitOptions, Tokenizer},
    };

    fn app() -> Router {
        let tokenizer = Tokenizer::fit(["great film", "awful film"], FitOptions::default()).expect("fit");
        let config = ClassifierConfig::new(tokenizer.vocab_size(), 8, 8, LabelMapping::sentiment());
        let model = BagOfWordsClassifier::new(config, 11).expect("model");
        router(Arc::new(SentimentPipeline::new(model, tokenizer)))
    }

    fn post_predict(body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("request")
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn predict_returns_label_and_score() {
        let response = app()
            .oneshot(post_predict(r#"{"text": "great!"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let label = body["label"].as_str().expect("label");
        assert!(label == "POSITIVE" || label == "NEGATIVE");
        let score = body["score"].as_f64().expect("score");
        assert!((0.0..=1.0).contains(&score));
    }

    #[tokio::test]
    async fn malformed_json_is_a_client_error() {
        let response = app()
            .oneshot(post_predict("{not json"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], 400);
        assert!(body["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn missing_text_field_is_a_client_error() {
        let response = app()
            .oneshot(post_predict(r#"{"review": "great"}"#))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], 422);
    }

    #[tokio::test]
    async fn missing_content_type_is_rejected() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/predict")
            .body(Body::from(r#"{"text": "great"}"#))
            .expect("request");
        let response = app().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn health_reports_labels() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let response = app().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["labels"], serde_json::json!(["NEGATIVE", "POSITIVE"]));
    }
}
