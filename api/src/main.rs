// ./api/src/main.rs
use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::{StatusCode, Uri},
    response::{IntoResponse, Json as JsonResponse, Response},
    routing::{delete, get},
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use application::{ApplicationError, Page, SensorRepository, SensorsService};
use domain::{ErrorCode, FieldError, FlatReq};
use infrastructure::{InMemorySensorRepository, SqliteSensorRepository};

mod config;

use config::ServerConfig;

const SENSOR_TYPES_PATH: &str = "/sensor-types";
const SENSORS_PATH: &str = "/sensors";
const SENSOR_READINGS_PATH: &str = "/sensor-readings";
const COUNT_PARAM: &str = "_count";
const CURSOR_PARAM: &str = "_cursor";

#[derive(Clone)]
struct AppState {
    sensors_service: Arc<SensorsService>,
    default_page_size: usize,
}

// Application entry point
#[tokio::main]
async fn main() {
    // --- Logger Initialization ---
    let filter: EnvFilter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    info!("Logger initialized successfully.");

    let config = ServerConfig::from_env();

    // --- Dependency Injection ---
    // 1. Create infrastructure components
    let repository: Arc<dyn SensorRepository> = match &config.database {
        Some(path) => match SqliteSensorRepository::open(path) {
            Ok(repository) => Arc::new(repository),
            Err(e) => {
                error!(path = %path.display(), "Failed to open sensor database: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("No SENSORS_DB set. Sensors info is kept in memory only.");
            Arc::new(InMemorySensorRepository::new())
        }
    };

    // 2. Create application services, injecting dependencies
    let sensors_service = Arc::new(SensorsService::new(repository, config.conflict_policy));
    info!(conflict_policy = %config.conflict_policy, "Sensors service initialized.");

    // 3. Create the application state
    let app_state = AppState {
        sensors_service: sensors_service.clone(),
        default_page_size: config.page_size,
    };

    let app = router(app_state);
    info!("API routes configured.");

    // --- Server Startup ---
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("Server listening on {}", addr);
            listener
        }
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    if let Err(e) = sensors_service.close().await {
        error!("Failed to close sensors repository: {}", e);
        std::process::exit(1);
    }
    info!("Server stopped.");
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            SENSOR_TYPES_PATH,
            get(find_sensor_types_handler).post(add_sensor_type_handler),
        )
        .route(SENSORS_PATH, get(find_sensors_handler).post(add_sensor_handler))
        .route(
            SENSOR_READINGS_PATH,
            get(find_sensor_readings_handler).post(add_sensor_reading_handler),
        )
        .route("/sensors-info", delete(clear_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received."),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

// --- Response Bodies ---

#[derive(Debug, Serialize)]
struct AddResponse<T> {
    result: T,
}

#[derive(Debug, Serialize, PartialEq)]
struct Link {
    rel: &'static str,
    href: String,
    method: &'static str,
}

impl Link {
    fn get(rel: &'static str, href: String) -> Self {
        Self {
            rel,
            href,
            method: "GET",
        }
    }
}

#[derive(Debug, Serialize)]
struct Links {
    #[serde(rename = "self")]
    this: Link,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev: Option<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<Link>,
}

#[derive(Debug, Serialize)]
struct FindResponse<T> {
    result: Vec<T>,
    links: Links,
}

#[derive(Debug, Serialize)]
struct ErrorsResponse {
    errors: Vec<FieldError>,
}

// --- Request Parsing ---

/// Coerces a JSON object of scalars into the flat string map the validators take.
fn flatten_body(body: Map<String, Value>) -> Result<FlatReq, Vec<FieldError>> {
    let mut req = FlatReq::with_capacity(body.len());
    let mut errors = Vec::new();
    for (name, value) in body {
        match value {
            Value::String(s) => {
                req.insert(name, s);
            }
            Value::Number(n) => {
                req.insert(name, n.to_string());
            }
            Value::Bool(b) => {
                req.insert(name, b.to_string());
            }
            Value::Null => {}
            Value::Array(_) | Value::Object(_) => errors.push(FieldError::for_widget(
                ErrorCode::BadVal,
                &name,
                format!("{} must be a string or a number", name),
            )),
        }
    }
    if errors.is_empty() { Ok(req) } else { Err(errors) }
}

#[derive(Debug, PartialEq)]
enum FindRequest {
    First { filters: FlatReq, page_size: usize },
    Resume(String),
}

/// Splits paging parameters from filters. A cursor makes every other parameter irrelevant.
fn parse_find_query(
    mut params: HashMap<String, String>,
    default_page_size: usize,
) -> Result<FindRequest, Vec<FieldError>> {
    if let Some(token) = params.remove(CURSOR_PARAM).filter(|t| !t.trim().is_empty()) {
        return Ok(FindRequest::Resume(token));
    }
    let page_size = match params.remove(COUNT_PARAM) {
        None => default_page_size,
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(count) if count > 0 => count,
            _ => {
                return Err(vec![FieldError::for_widget(
                    ErrorCode::BadVal,
                    COUNT_PARAM,
                    format!("{} must be a positive integer, got '{}'", COUNT_PARAM, raw),
                )]);
            }
        },
    };
    Ok(FindRequest::First {
        filters: params.into_iter().collect(),
        page_size,
    })
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Required | ErrorCode::BadVal | ErrorCode::BadRange | ErrorCode::BadId => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::Exists => StatusCode::CONFLICT,
        ErrorCode::Db => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn errors_response(status: StatusCode, errors: Vec<FieldError>) -> Response {
    (status, JsonResponse(ErrorsResponse { errors })).into_response()
}

fn links_for<T>(path: &str, uri: &Uri, page: &Page<T>) -> Result<Links, ApplicationError> {
    let href = |token: String| format!("{}?{}={}", path, CURSOR_PARAM, token);
    Ok(Links {
        this: Link::get("self", uri.to_string()),
        prev: page.prev_token()?.map(|token| Link::get("prev", href(token))),
        next: page.next_token()?.map(|token| Link::get("next", href(token))),
    })
}

// --- API Handlers ---

async fn health_check() -> impl IntoResponse {
    info!("Health check endpoint called");
    (StatusCode::OK, "OK")
}

fn add_response<T: Serialize>(result: Result<T, ApplicationError>) -> Response {
    match result {
        Ok(record) => {
            (StatusCode::CREATED, JsonResponse(AddResponse { result: record })).into_response()
        }
        Err(e) => map_application_error_to_response(e),
    }
}

fn find_response<T: Serialize>(
    path: &str,
    uri: &Uri,
    result: Result<Page<T>, ApplicationError>,
) -> Response {
    let page = match result {
        Ok(page) => page,
        Err(e) => return map_application_error_to_response(e),
    };
    match links_for(path, uri, &page) {
        Ok(links) => {
            let body = FindResponse {
                result: page.values,
                links,
            };
            (StatusCode::OK, JsonResponse(body)).into_response()
        }
        Err(e) => map_application_error_to_response(e),
    }
}

/// Unwraps the JSON body of an add request into a [`FlatReq`].
fn body_fields(
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<FlatReq, Response> {
    let Json(body) = payload.map_err(|rejection| {
        warn!("Rejected request body: {}", rejection.body_text());
        errors_response(
            StatusCode::BAD_REQUEST,
            vec![FieldError::new(ErrorCode::BadVal, rejection.body_text())],
        )
    })?;
    flatten_body(body).map_err(|errors| errors_response(StatusCode::BAD_REQUEST, errors))
}

/// Handler for adding a sensor-type (POST /sensor-types).
async fn add_sensor_type_handler(
    State(state): State<AppState>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Response {
    let req = match body_fields(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    add_response(state.sensors_service.add_sensor_type(&req).await)
}

/// Handler for adding a sensor (POST /sensors).
async fn add_sensor_handler(
    State(state): State<AppState>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Response {
    let req = match body_fields(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    add_response(state.sensors_service.add_sensor(&req).await)
}

/// Handler for adding a reading (POST /sensor-readings).
async fn add_sensor_reading_handler(
    State(state): State<AppState>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Response {
    let req = match body_fields(payload) {
        Ok(req) => req,
        Err(response) => return response,
    };
    add_response(state.sensors_service.add_sensor_reading(&req).await)
}

/// Handler for finding sensor-types (GET /sensor-types?...).
async fn find_sensor_types_handler(
    State(state): State<AppState>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let service = &state.sensors_service;
    let result = match parse_find_query(params, state.default_page_size) {
        Ok(FindRequest::Resume(token)) => service.find_sensor_types_at(&token).await,
        Ok(FindRequest::First { filters, page_size }) => {
            service.find_sensor_types_page(&filters, page_size).await
        }
        Err(errors) => return errors_response(StatusCode::BAD_REQUEST, errors),
    };
    find_response(SENSOR_TYPES_PATH, &uri, result)
}

/// Handler for finding sensors (GET /sensors?...).
async fn find_sensors_handler(
    State(state): State<AppState>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let service = &state.sensors_service;
    let result = match parse_find_query(params, state.default_page_size) {
        Ok(FindRequest::Resume(token)) => service.find_sensors_at(&token).await,
        Ok(FindRequest::First { filters, page_size }) => {
            service.find_sensors_page(&filters, page_size).await
        }
        Err(errors) => return errors_response(StatusCode::BAD_REQUEST, errors),
    };
    find_response(SENSORS_PATH, &uri, result)
}

/// Handler for finding readings of one sensor (GET /sensor-readings?sensorId=...).
async fn find_sensor_readings_handler(
    State(state): State<AppState>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let service = &state.sensors_service;
    let result = match parse_find_query(params, state.default_page_size) {
        Ok(FindRequest::Resume(token)) => service.find_sensor_readings_at(&token).await,
        Ok(FindRequest::First { filters, page_size }) => {
            service.find_sensor_readings_page(&filters, page_size).await
        }
        Err(errors) => return errors_response(StatusCode::BAD_REQUEST, errors),
    };
    find_response(SENSOR_READINGS_PATH, &uri, result)
}

/// Handler for removing all sensors info (DELETE /sensors-info).
async fn clear_handler(State(state): State<AppState>) -> Response {
    info!("Received request to clear sensors info");
    match state.sensors_service.clear().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => map_application_error_to_response(e),
    }
}

/// Maps an ApplicationError to its HTTP status and `{ "errors": [...] }` body.
fn map_application_error_to_response(err: ApplicationError) -> Response {
    let status = status_for(err.code());
    match &err {
        ApplicationError::DatabaseError(msg) => {
            error!("Underlying database error: {}", msg);
        }
        other => warn!(status = status.as_u16(), "Request failed: {}", other),
    }
    errors_response(status, err.errors())
}
