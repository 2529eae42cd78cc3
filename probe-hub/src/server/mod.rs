//! The HTTP API.
//!
//! Requests are served in parallel; the only serialization point is the
//! probe lock inside the dispatcher. Mutating endpoints answer JSON with a
//! `status` field and, where tool output exists, a `log` field.

use std::sync::Arc;

use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{Mode, ProbeInterface, Transport, UsbId};
use crate::dispatch::{DispatchError, DispatchOutcome, DispatchRequest, Hub};
use crate::inventory::SearchFilter;
use crate::session::{StopKind, StopOutcome};
use crate::staging::{StagedFirmware, StagingError, T_UPLOAD_IDLE};

/// Builds the API router around a shared hub.
pub fn router(hub: Arc<Hub>) -> Router {
    let upload_limit = hub.config().staging.max_upload_size as usize + 1024 * 1024;
    Router::new()
        .route("/status", get(get_status))
        .route("/probes", get(get_probes))
        .route("/probes/search", get(search_probes))
        .route("/targets", get(get_targets))
        .route("/dispatch", post(post_dispatch))
        .route("/session/stop", post(post_session_stop))
        .layer(DefaultBodyLimit::max(upload_limit))
        .with_state(hub)
}

/// Binds and serves until ctrl-c, then force-stops every live session so no
/// vendor server outlives the hub.
pub async fn serve(hub: Arc<Hub>, address: &str, port: u16) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("{address}:{port}")).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router(hub.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, stopping live sessions");
    hub.stop_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!("ctrl-c handler failed: {error}");
    }
}

/// Dispatch errors as HTTP responses.
struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        Self(error)
    }
}

fn http_code(error: &DispatchError) -> StatusCode {
    match error {
        DispatchError::InvalidRequest(_)
        | DispatchError::IncompatibleProbe { .. }
        | DispatchError::InvalidTransport { .. } => StatusCode::BAD_REQUEST,
        DispatchError::UnknownTarget(_) | DispatchError::UnknownProbe(_) => StatusCode::NOT_FOUND,
        DispatchError::ProbeNotConnected(_) | DispatchError::ContainerStart(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DispatchError::ProbeBusy(_) | DispatchError::UploadAborted => StatusCode::CONFLICT,
        DispatchError::Staging(StagingError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        DispatchError::Staging(_) => StatusCode::BAD_REQUEST,
        DispatchError::NoCommand { .. }
        | DispatchError::Template(_)
        | DispatchError::ToolFailed { .. }
        | DispatchError::Lock(_)
        | DispatchError::Container(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = http_code(&self.0);
        let mut body = json!({
            "status": self.0.status(),
            "message": self.0.to_string(),
        });
        if let Some(log) = self.0.log() {
            body["log"] = log.into();
        }
        if code.is_server_error() {
            tracing::error!(status = self.0.status(), "{}", self.0);
        } else {
            tracing::debug!(status = self.0.status(), "{}", self.0);
        }
        (code, Json(body)).into_response()
    }
}

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError(DispatchError::InvalidRequest(message.into()))
}

async fn get_status(State(hub): State<Arc<Hub>>) -> Response {
    Json(hub.status_records()).into_response()
}

async fn get_probes(State(hub): State<Arc<Hub>>) -> Response {
    Json(&hub.config().probes).into_response()
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchQuery {
    interface: Option<String>,
    vid: Option<String>,
    pid: Option<String>,
    serial: Option<String>,
    name: Option<String>,
}

impl SearchQuery {
    fn to_filter(&self) -> Result<SearchFilter, ApiError> {
        let interface = self
            .interface
            .as_deref()
            .map(|raw| raw.parse::<ProbeInterface>().map_err(invalid))
            .transpose()?;
        let vid = self
            .vid
            .as_deref()
            .map(|raw| UsbId::parse(raw).map_err(invalid))
            .transpose()?;
        let pid = self
            .pid
            .as_deref()
            .map(|raw| UsbId::parse(raw).map_err(invalid))
            .transpose()?;
        Ok(SearchFilter {
            interface,
            vid,
            pid,
            serial: self.serial.clone(),
            name: self.name.clone(),
        })
    }
}

async fn search_probes(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<SearchQuery>,
) -> Result<Response, ApiError> {
    let filter = query.to_filter()?;
    let matches = hub.inventory().search(hub.config(), &filter);
    let count = matches.len();
    Ok(Json(json!({
        "query": query,
        "matches": matches,
        "count": count,
    }))
    .into_response())
}

async fn get_targets(State(hub): State<Arc<Hub>>) -> Response {
    #[derive(Serialize)]
    struct TargetRecord<'a> {
        name: &'a str,
        description: &'a str,
        compatible_probes: &'a crate::config::CompatibleProbes,
        transports: &'a std::collections::BTreeMap<ProbeInterface, crate::config::TransportPolicy>,
    }

    let records: Vec<TargetRecord> = hub
        .config()
        .targets
        .iter()
        .map(|(name, target)| TargetRecord {
            name,
            description: &target.description,
            compatible_probes: &target.compatible_probes,
            transports: &target.transports,
        })
        .collect();
    Json(records).into_response()
}

#[derive(Debug, Default)]
struct DispatchFields {
    target: Option<String>,
    probe: Option<u16>,
    mode: Option<Mode>,
    transport: Option<Transport>,
}

impl DispatchFields {
    fn to_request(&self) -> Result<DispatchRequest, ApiError> {
        Ok(DispatchRequest {
            target: self
                .target
                .clone()
                .ok_or_else(|| invalid("missing field 'target'"))?,
            probe: self.probe.ok_or_else(|| invalid("missing field 'probe'"))?,
            mode: self.mode.ok_or_else(|| invalid("missing field 'mode'"))?,
            transport: self.transport,
        })
    }
}

async fn post_dispatch(
    State(hub): State<Arc<Hub>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut fields = DispatchFields::default();
    let mut staged: Option<StagedFirmware> = None;
    let mut request: Option<DispatchRequest> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|error| invalid(format!("malformed multipart request: {error}")))?
    {
        let name = field
            .name()
            .ok_or_else(|| invalid("multipart field without a name"))?
            .to_string();

        if staged.is_some() {
            // The routing fields decide how the file is handled, so they
            // must arrive before it.
            return Err(invalid(format!("field '{name}' must precede 'file'")));
        }

        match name.as_str() {
            "target" => fields.target = Some(field_text(field).await?),
            "probe" => {
                let raw = field_text(field).await?;
                fields.probe =
                    Some(raw.parse().map_err(|_| {
                        invalid(format!("'{raw}' is not a valid probe id"))
                    })?);
            }
            "mode" => {
                let raw = field_text(field).await?;
                fields.mode = Some(raw.parse().map_err(invalid)?);
            }
            "transport" => {
                let raw = field_text(field).await?;
                fields.transport = Some(raw.parse().map_err(invalid)?);
            }
            "file" => {
                let parsed = fields.to_request()?;
                if parsed.mode != Mode::Flash {
                    return Err(invalid("a firmware file is only valid in flash mode"));
                }
                // Fail fast before accepting the upload stream.
                hub.validate(&parsed)?;
                staged = Some(stage_upload(&hub, parsed.probe, &mut field).await?);
                request = Some(parsed);
            }
            other => return Err(invalid(format!("unknown field '{other}'"))),
        }
    }

    let request = match request {
        Some(request) => request,
        None => fields.to_request()?,
    };

    let outcome = hub.dispatch(request, staged).await?;
    Ok(dispatch_response(outcome))
}

async fn field_text(field: Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|error| invalid(format!("unreadable field: {error}")))
}

/// Streams the file field into staging, honoring the idle timeout and a
/// concurrent `kind=all` stop.
async fn stage_upload(
    hub: &Hub,
    probe_id: u16,
    field: &mut Field<'_>,
) -> Result<StagedFirmware, ApiError> {
    let original = field
        .file_name()
        .ok_or_else(|| invalid("file field without a filename"))?
        .to_string();

    let upload = hub.register_upload(probe_id);
    let mut writer = hub
        .staging()
        .create(&original)
        .await
        .map_err(DispatchError::Staging)?;

    loop {
        let chunk = tokio::select! {
            chunk = tokio::time::timeout(T_UPLOAD_IDLE, field.chunk()) => match chunk {
                Err(_) => {
                    writer.discard().await;
                    return Err(DispatchError::Staging(StagingError::Stalled).into());
                }
                Ok(Err(error)) => {
                    writer.discard().await;
                    return Err(invalid(format!("upload stream failed: {error}")));
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(chunk))) => chunk,
            },
            _ = upload.token.cancelled() => {
                writer.discard().await;
                return Err(DispatchError::UploadAborted.into());
            }
        };
        writer
            .write_chunk(&chunk)
            .await
            .map_err(DispatchError::Staging)?;
    }

    tracing::debug!(bytes = writer.written(), file = %original, "upload staged");
    let staged = writer.finish().await.map_err(DispatchError::Staging)?;
    Ok(staged)
}

fn dispatch_response(outcome: DispatchOutcome) -> Response {
    match outcome {
        DispatchOutcome::Flash {
            exit_code,
            stdout,
            stderr,
            duration,
        } => {
            let log = if stderr.is_empty() {
                stdout.clone()
            } else if stdout.is_empty() {
                stderr.clone()
            } else {
                format!("{stdout}\n{stderr}")
            };
            Json(json!({
                "status": "ok",
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
                "duration": duration.as_secs_f64(),
                "log": log,
            }))
            .into_response()
        }
        DispatchOutcome::Started { mode, ports } => match mode {
            Mode::Print => Json(json!({
                "status": "started",
                "print_port": ports.print,
            }))
            .into_response(),
            _ => Json(json!({
                "status": "started",
                "gdb_port": ports.gdb,
                "telnet_port": ports.telnet,
                "rtt_port": ports.rtt,
            }))
            .into_response(),
        },
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StopForm {
    probe: String,
    kind: Option<String>,
}

async fn post_session_stop(
    State(hub): State<Arc<Hub>>,
    Form(form): Form<StopForm>,
) -> Result<Response, ApiError> {
    let probe: u16 = form
        .probe
        .parse()
        .map_err(|_| invalid(format!("'{}' is not a valid probe id", form.probe)))?;
    let kind: StopKind = match form.kind.as_deref() {
        Some(raw) => raw.parse().map_err(invalid)?,
        None => StopKind::default(),
    };

    let outcome = hub.stop(probe, kind).await;
    if outcome.is_empty() {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "no_session",
                "log": format!("no active session for probe {probe}"),
            })),
        )
            .into_response());
    }

    Ok(Json(json!({
        "status": "ok",
        "log": stop_log(probe, &outcome),
    }))
    .into_response())
}

fn stop_log(probe: u16, outcome: &StopOutcome) -> String {
    let mut parts: Vec<String> = outcome
        .stopped
        .iter()
        .map(|mode| format!("stopped {mode} session on probe {probe}"))
        .collect();
    if outcome.upload_aborted {
        parts.push(format!("aborted in-flight upload for probe {probe}"));
    }
    parts.join("; ")
}
