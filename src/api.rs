use std::sync::Arc;
use std::time::Instant;

use log::{error, info};
use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{catch, catchers, get, post, routes, Build, Rocket, State};

use crate::sentiment::{ModelError, SentimentModel};
use crate::types::{ErrorDetail, ErrorMessage, HealthResponse, PredictResponse, TextInput};

const GENERIC_ERROR: &str = "Internal Server Error. Please try again later.";

/// Cause of an unhandled failure, stashed on the request for the 500 catcher.
struct UnhandledCause(Option<String>);

/// Every way a request can fail once it has reached a handler.
#[derive(Debug)]
pub enum ApiError {
    /// The pipeline was never loaded. 503.
    ModelUnavailable(&'static str),
    /// The pipeline raised during inference. 500, message passed through.
    Inference(String),
    /// Anything else. 500 with the generic message; the cause stays in the log.
    Unhandled(String),
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        match self {
            ApiError::ModelUnavailable(detail) => (
                Status::ServiceUnavailable,
                Json(ErrorDetail {
                    detail: detail.to_string(),
                }),
            )
                .respond_to(req),
            ApiError::Inference(detail) => {
                (Status::InternalServerError, Json(ErrorDetail { detail })).respond_to(req)
            }
            ApiError::Unhandled(cause) => {
                req.local_cache(|| UnhandledCause(Some(cause)));
                // the 500 catcher logs and answers
                Err(Status::InternalServerError)
            }
        }
    }
}

#[get("/")]
pub async fn health(
    model: &State<Arc<SentimentModel>>,
) -> Result<Json<HealthResponse>, ApiError> {
    if !model.is_loaded() {
        return Err(ApiError::ModelUnavailable("Model is not loaded properly"));
    }

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        message: "The service is up and running".to_string(),
    }))
}

#[post("/predict", data = "<input>")]
pub async fn predict(
    model: &State<Arc<SentimentModel>>,
    input: Json<TextInput>,
) -> Result<Json<PredictResponse>, ApiError> {
    if !model.is_loaded() {
        return Err(ApiError::ModelUnavailable("Model is not available"));
    }

    let model = Arc::clone(model.inner());
    let text = input.into_inner().text;

    let start = Instant::now();
    let outcome = tokio::task::spawn_blocking(move || model.predict(&text)).await;
    let inference_time = start.elapsed().as_secs_f64();

    match outcome {
        Ok(Ok(sentiment)) => {
            info!(
                "Prediction: {:?} | Inference time: {:.4} seconds",
                sentiment, inference_time
            );
            Ok(Json(PredictResponse {
                sentiment,
                inference_time,
            }))
        }
        Ok(Err(ModelError::InvalidState)) => Err(ApiError::ModelUnavailable("Model is not available")),
        Ok(Err(e @ ModelError::InferenceFailure { .. })) => {
            error!("Error during inference: {}", e);
            Err(ApiError::Inference(e.to_string()))
        }
        // the pipeline panicked or the blocking pool went away
        Err(e) => Err(ApiError::Unhandled(e.to_string())),
    }
}

#[catch(400)]
pub fn bad_request(_req: &Request) -> Json<ErrorDetail> {
    Json(ErrorDetail {
        detail: "Request body is not valid JSON".to_string(),
    })
}

#[catch(422)]
pub fn unprocessable(_req: &Request) -> Json<ErrorDetail> {
    Json(ErrorDetail {
        detail: "Request body must be a JSON object with a string `text` field".to_string(),
    })
}

fn unhandled_summary(req: &Request<'_>) -> String {
    match &req.local_cache(|| UnhandledCause(None)).0 {
        Some(cause) => format!("Unhandled error: {} | Request: {}", cause, req.uri()),
        None => format!("Unhandled error | Request: {}", req.uri()),
    }
}

#[catch(500)]
pub fn internal_error(req: &Request) -> Json<ErrorMessage> {
    error!("{}", unhandled_summary(req));
    Json(ErrorMessage {
        message: GENERIC_ERROR.to_string(),
    })
}

#[catch(default)]
pub fn fallback(status: Status, _req: &Request) -> (Status, Json<ErrorDetail>) {
    let detail = status.reason().unwrap_or("Unknown Error").to_string();
    (status, Json(ErrorDetail { detail }))
}

/// Mounts the routes and JSON catchers. The caller is responsible for putting
/// an `Arc<SentimentModel>` into managed state.
pub fn mount(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .mount("/", routes![health, predict])
        .register(
            "/",
            catchers![bad_request, unprocessable, internal_error, fallback],
        )
}
