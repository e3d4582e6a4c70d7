use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use cruiselog_core::{Command, CommandError, ModeName};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{io, net::SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_graceful_shutdown::SubsystemHandle;

use crate::control::{ControlError, ControlHandle, ControlReply};

const LOGGERS_URI: &str = "/api/v1/loggers";
const LOGGER_URI: &str = "/api/v1/loggers/{instrument_id}";
const MODE_URI: &str = "/api/v1/mode";
const MODES_URI: &str = "/api/v1/modes";

#[derive(Error, Debug)]
pub enum WebError {
    #[error("Socket operation failed")]
    Io(#[from] io::Error),
}

/// REST front end of the control surface. Every mutating request becomes
/// a [`Command`] and goes through the same channel as console input.
#[derive(Clone)]
pub struct Web {
    control: ControlHandle,
}

impl Web {
    pub fn new(control: ControlHandle) -> Self {
        Web { control }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route(LOGGERS_URI, get(get_loggers))
            .route(LOGGER_URI, get(get_logger).put(put_logger))
            .route(MODE_URI, get(get_mode).put(put_mode))
            .route(MODES_URI, get(get_modes))
            .with_state(self)
    }

    pub async fn run(self, subsys: SubsystemHandle, addr: SocketAddr) -> Result<(), WebError> {
        let listener = TcpListener::bind(addr).await?;
        let shutdown = subsys.create_cancellation_token();

        info!("Starting HTTP web server on {}", addr);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        debug!("HTTP web server stopped");
        Ok(())
    }
}

#[derive(Deserialize)]
struct InstrumentIdParam {
    instrument_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModeRequest {
    mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LoggerAction {
    Start,
    Stop,
}

/// Either `{"mode": "..."}` or `{"action": "start" | "stop"}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LoggerRequest {
    Mode { mode: String },
    Action { action: LoggerAction },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModeApi {
    global_mode: Option<ModeName>,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}

fn command_error_response(e: CommandError) -> Response {
    let status = match e {
        CommandError::UnknownInstrument(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(status, e)
}

fn control_error_response(e: ControlError) -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, e)
}

fn reply_response(reply: ControlReply) -> Response {
    match reply {
        ControlReply::Rejected { error } => error_response(StatusCode::BAD_REQUEST, error),
        ControlReply::Failed { error } => error_response(StatusCode::INTERNAL_SERVER_ERROR, error),
        ControlReply::Logger { status } => Json(status).into_response(),
        reply => Json(reply).into_response(),
    }
}

async fn send(web: &Web, tokens: &[&str]) -> Response {
    match web.control.send_tokens(tokens).await {
        Ok(Ok(reply)) => reply_response(reply),
        Ok(Err(e)) => command_error_response(e),
        Err(e) => control_error_response(e),
    }
}

async fn status(web: &Web) -> Result<ControlReply, Response> {
    web.control
        .send(Command::Status)
        .await
        .map_err(control_error_response)
}

async fn get_loggers(State(web): State<Web>) -> Response {
    match status(&web).await {
        Ok(ControlReply::Status { loggers, .. }) => Json(loggers).into_response(),
        Ok(reply) => reply_response(reply),
        Err(response) => response,
    }
}

async fn get_logger(State(web): State<Web>, Path(params): Path<InstrumentIdParam>) -> Response {
    match status(&web).await {
        Ok(ControlReply::Status { loggers, .. }) => match loggers.get(&params.instrument_id) {
            Some(logger) => Json(logger).into_response(),
            None => command_error_response(CommandError::UnknownInstrument(params.instrument_id)),
        },
        Ok(reply) => reply_response(reply),
        Err(response) => response,
    }
}

async fn put_logger(
    State(web): State<Web>,
    Path(params): Path<InstrumentIdParam>,
    Json(request): Json<LoggerRequest>,
) -> Response {
    debug!("PUT logger {}: {:?}", params.instrument_id, request);
    let action = match &request {
        LoggerRequest::Mode { mode } => mode.as_str(),
        LoggerRequest::Action {
            action: LoggerAction::Start,
        } => "start",
        LoggerRequest::Action {
            action: LoggerAction::Stop,
        } => "stop",
    };
    send(&web, &[params.instrument_id.as_str(), action]).await
}

async fn get_mode(State(web): State<Web>) -> Response {
    match status(&web).await {
        Ok(ControlReply::Status { global_mode, .. }) => Json(ModeApi { global_mode }).into_response(),
        Ok(reply) => reply_response(reply),
        Err(response) => response,
    }
}

async fn put_mode(State(web): State<Web>, Json(request): Json<ModeRequest>) -> Response {
    // A single token would also accept "status" or "quit"
    if !web.control.fleet().modes.contains(&request.mode) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("Unknown mode '{}'", request.mode),
        );
    }
    send(&web, &[request.mode.as_str()]).await
}

async fn get_modes(State(web): State<Web>) -> Response {
    Json(web.control.fleet().modes.names()).into_response()
}
