//! The dispatch engine.
//!
//! A dispatch names a target, a probe and a mode. Validation fails fast in a
//! fixed order (target, probe presence, compatibility, transport, firmware),
//! then the command template is rendered, the probe lock taken non-blocking,
//! and the work executed: flash runs to completion under the caller's
//! request, debug and print hand a spawned server to a supervisor task and
//! return immediately.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{
    CommandTemplate, HubConfig, Mode, ProbeInterface, TemplateError, TemplateValues, Transport,
};
use crate::container::{ContainerError, ContainerManager, ExecOutput};
use crate::inventory::{Inventory, ProbeStatus};
use crate::lock::{self, LockError};
use crate::ports::SessionPorts;
use crate::session::{
    SessionInfo, SessionTable, StopKind, StopOutcome, StopReason, Supervisor, UploadGuard,
};
use crate::staging::{StagedFirmware, Staging, StagingError};

/// Everything that can go wrong between a dispatch request and its outcome.
/// Each variant surfaces as a distinct `status` string on the wire.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum DispatchError {
    /// Invalid request: {0}
    InvalidRequest(String),
    /// Unknown target `{0}`.
    UnknownTarget(String),
    /// Unknown probe `{0}`.
    UnknownProbe(u16),
    /// Probe {probe} ({interface}) is not compatible with target `{target}` in {mode} mode.
    IncompatibleProbe {
        target: String,
        probe: u16,
        interface: ProbeInterface,
        mode: Mode,
    },
    /// Transport {transport} is not allowed for target `{target}` on {interface}.
    InvalidTransport {
        target: String,
        interface: ProbeInterface,
        transport: Transport,
    },
    /// Probe {0} is not connected.
    ProbeNotConnected(u16),
    /// Probe {0} is busy.
    ProbeBusy(u16),
    /// No command is configured for target `{target}`, interface {interface}, mode {mode}.
    NoCommand {
        target: String,
        interface: ProbeInterface,
        mode: Mode,
    },
    /// {0}
    Template(#[from] TemplateError),
    /// {0}
    ContainerStart(#[source] ContainerError),
    /// Tool failed with exit code {code}.
    ToolFailed { code: i32, log: String },
    /// {0}
    Staging(#[from] StagingError),
    /// Upload aborted by a concurrent stop request.
    UploadAborted,
    /// Probe lock error: {0}
    Lock(#[source] LockError),
    /// Container runtime error: {0}
    Container(#[source] ContainerError),
}

impl DispatchError {
    /// The wire-visible `status` string for this error.
    pub fn status(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::UnknownTarget(_) => "UnknownTarget",
            Self::UnknownProbe(_) => "UnknownProbe",
            Self::IncompatibleProbe { .. } => "IncompatibleProbe",
            Self::InvalidTransport { .. } => "InvalidTransport",
            Self::ProbeNotConnected(_) => "ProbeNotConnected",
            Self::ProbeBusy(_) => "ProbeBusy",
            Self::NoCommand { .. } | Self::Template(_) => "TemplateError",
            Self::ContainerStart(_) => "ContainerStartFailed",
            Self::ToolFailed { .. } => "ToolFailed",
            Self::Staging(inner) => match inner {
                StagingError::Io(_) => "InternalError",
                _ => "InvalidRequest",
            },
            Self::UploadAborted => "UploadAborted",
            Self::Lock(_) | Self::Container(_) => "InternalError",
        }
    }

    /// Captured tool output, where the error carries any.
    pub fn log(&self) -> Option<&str> {
        match self {
            Self::ToolFailed { log, .. } => Some(log),
            _ => None,
        }
    }
}

/// A dispatch request, after field parsing but before validation.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub target: String,
    pub probe: u16,
    pub mode: Mode,
    pub transport: Option<Transport>,
}

/// A validated request with everything resolved except the firmware path.
#[derive(Debug)]
pub struct PreparedDispatch {
    pub probe_id: u16,
    pub mode: Mode,
    pub interface: ProbeInterface,
    pub transport: Option<Transport>,
    pub ports: SessionPorts,
    pub container_service: String,
    template: CommandTemplate,
    serial: Option<String>,
    device_path: PathBuf,
    uart_baud: u32,
}

impl PreparedDispatch {
    fn render(&self, firmware: Option<&Path>) -> Result<String, TemplateError> {
        let values = TemplateValues {
            serial: self.serial.clone(),
            gdb_port: self.ports.gdb,
            telnet_port: self.ports.telnet,
            rtt_port: self.ports.rtt,
            print_port: self.ports.print,
            firmware_path: firmware.map(|p| p.display().to_string()),
            device_path: Some(self.device_path.display().to_string()),
            transport: self.transport,
            uart_baud: Some(self.uart_baud),
        };
        self.template.render(&values)
    }
}

/// The result of a successful dispatch.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A flash command ran to completion with exit code zero.
    Flash {
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration: Duration,
    },
    /// A long-lived server was spawned and handed to its supervisor.
    Started { mode: Mode, ports: SessionPorts },
}

/// One `/status` row: the inventory join plus session bookkeeping.
#[derive(Debug, serde::Serialize)]
pub struct StatusRecord {
    #[serde(flatten)]
    pub probe: ProbeStatus,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stop_reason: Option<StopReason>,
}

/// The dispatch and session engine, shared across all HTTP requests.
#[derive(Debug)]
pub struct Hub {
    config: HubConfig,
    inventory: Inventory,
    containers: ContainerManager,
    staging: Staging,
    sessions: SessionTable,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_inventory(config, Inventory::new())
    }

    pub fn with_inventory(config: HubConfig, inventory: Inventory) -> Self {
        let containers = ContainerManager::new(config.compose_file.clone());
        let staging = Staging::new(&config.staging);
        Self {
            config,
            inventory,
            containers,
            staging,
            sessions: SessionTable::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn staging(&self) -> &Staging {
        &self.staging
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// `/status` rows for every configured probe.
    pub fn status_records(&self) -> Vec<StatusRecord> {
        self.inventory
            .status(&self.config)
            .into_iter()
            .map(|probe| {
                let id = probe.id;
                StatusRecord {
                    busy: self.sessions.is_busy(id),
                    session: self.sessions.info(id),
                    last_stop_reason: self.sessions.last_reason(id),
                    probe,
                }
            })
            .collect()
    }

    /// Marks an upload in flight so `/session/stop kind=all` can abort it.
    pub fn register_upload(&self, probe_id: u16) -> UploadGuard {
        self.sessions.register_upload(probe_id)
    }

    /// Stops matching sessions on a probe and waits for lock release.
    pub async fn stop(&self, probe_id: u16, kind: StopKind) -> StopOutcome {
        self.sessions.stop_matching(probe_id, kind).await
    }

    /// Stops every live session. Used at server shutdown.
    pub async fn stop_all(&self) {
        self.sessions.stop_all().await;
    }

    /// Runs the validation chain (target, probe presence, compatibility,
    /// transport) and resolves ports, container and template. No state is
    /// changed.
    pub fn validate(&self, request: &DispatchRequest) -> Result<PreparedDispatch, DispatchError> {
        // 1. Target exists.
        let target = self
            .config
            .target(&request.target)
            .ok_or_else(|| DispatchError::UnknownTarget(request.target.clone()))?;

        // 2. Probe exists and is connected.
        let probe = self
            .config
            .probe(request.probe)
            .ok_or(DispatchError::UnknownProbe(request.probe))?;
        let status = self
            .inventory
            .status_of(&self.config, request.probe)
            .ok_or(DispatchError::UnknownProbe(request.probe))?;
        if !status.connected {
            return Err(DispatchError::ProbeNotConnected(request.probe));
        }

        // 3. The probe's interface serves this target in this mode.
        if !target
            .compatible_probes
            .for_mode(request.mode)
            .contains(&probe.interface)
        {
            return Err(DispatchError::IncompatibleProbe {
                target: request.target.clone(),
                probe: request.probe,
                interface: probe.interface,
                mode: request.mode,
            });
        }

        // 4. Transport policy. A supplied transport must be allowed; absent
        // policy leaves the placeholder unset and rendering fails closed if
        // the template needs it.
        let transport = match (target.transports.get(&probe.interface), request.transport) {
            (Some(policy), Some(requested)) => {
                if !policy.allowed.contains(&requested) {
                    return Err(DispatchError::InvalidTransport {
                        target: request.target.clone(),
                        interface: probe.interface,
                        transport: requested,
                    });
                }
                Some(requested)
            }
            (Some(policy), None) => Some(policy.default),
            (None, Some(requested)) => {
                return Err(DispatchError::InvalidTransport {
                    target: request.target.clone(),
                    interface: probe.interface,
                    transport: requested,
                });
            }
            (None, None) => None,
        };

        let template = self
            .config
            .resolve_command(target, probe.interface, request.mode)
            .ok_or_else(|| DispatchError::NoCommand {
                target: request.target.clone(),
                interface: probe.interface,
                mode: request.mode,
            })?
            .clone();

        // A target may omit the transport policy only when the command never
        // asks for one; catch that here instead of at render time.
        if transport.is_none() && template.references("transport") {
            return Err(DispatchError::Template(TemplateError::MissingValue {
                name: "transport".into(),
            }));
        }

        let container_key =
            target
                .container_for(probe.interface)
                .ok_or_else(|| DispatchError::NoCommand {
                    target: request.target.clone(),
                    interface: probe.interface,
                    mode: request.mode,
                })?;
        let container_service = self
            .config
            .container_runtime_name(container_key, probe.id)
            .ok_or_else(|| DispatchError::NoCommand {
                target: request.target.clone(),
                interface: probe.interface,
                mode: request.mode,
            })?;

        Ok(PreparedDispatch {
            probe_id: probe.id,
            mode: request.mode,
            interface: probe.interface,
            transport,
            ports: self.config.ports.allocate(probe.id),
            container_service,
            template,
            serial: probe.serial.clone().or(status.observed_serial),
            device_path: probe.device_path(),
            uart_baud: probe.uart_baud.unwrap_or(115_200),
        })
    }

    /// Runs a dispatch to completion (flash) or to a started session
    /// (debug/print). `firmware` must be staged for flash mode and absent
    /// otherwise.
    #[tracing::instrument(skip(self, firmware), fields(target = %request.target, probe = request.probe, mode = %request.mode))]
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
        firmware: Option<StagedFirmware>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let prepared = self.validate(&request)?;

        // 5. A firmware blob is required iff the mode is flash.
        match (request.mode, firmware.is_some()) {
            (Mode::Flash, false) => {
                return Err(DispatchError::InvalidRequest(
                    "flash mode requires a firmware file".into(),
                ));
            }
            (Mode::Debug | Mode::Print, true) => {
                return Err(DispatchError::InvalidRequest(
                    "a firmware file is only valid in flash mode".into(),
                ));
            }
            _ => {}
        }

        let command = prepared.render(firmware.as_ref().map(StagedFirmware::path))?;
        tracing::debug!(%command, container = %prepared.container_service, "rendered command");

        match request.mode {
            Mode::Flash => self.run_flash(prepared, command, firmware).await,
            Mode::Debug | Mode::Print => self.start_session(prepared, command).await,
        }
    }

    async fn run_flash(
        &self,
        prepared: PreparedDispatch,
        command: String,
        firmware: Option<StagedFirmware>,
    ) -> Result<DispatchOutcome, DispatchError> {
        // Declared before the lock so its drop (which signals waiting stop
        // requests) runs strictly after the lock release.
        let guard;
        let lock = lock::try_acquire(&self.config.locks.dir, prepared.probe_id).map_err(
            |error| match error {
                LockError::Busy { probe_id } => DispatchError::ProbeBusy(probe_id),
                other => DispatchError::Lock(other),
            },
        )?;

        let token = CancellationToken::new();
        guard = self.sessions.register_flash(
            prepared.probe_id,
            prepared.container_service.clone(),
            prepared.ports,
            token.clone(),
        );

        let result = self
            .exec_flash(&prepared.container_service, &command, &token)
            .await;

        // Staged firmware is removed whatever the outcome, before the lock
        // opens the probe to the next dispatch.
        if let Some(firmware) = firmware {
            firmware.remove().await;
        }
        drop(lock);

        match result {
            Ok(output) if output.success() => {
                guard.finish(None);
                tracing::info!(
                    probe = prepared.probe_id,
                    duration_ms = output.duration.as_millis() as u64,
                    "flash finished"
                );
                Ok(DispatchOutcome::Flash {
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    duration: output.duration,
                })
            }
            Ok(output) => {
                guard.finish(None);
                Err(DispatchError::ToolFailed {
                    code: output.exit_code,
                    log: output.combined_log(),
                })
            }
            Err(ContainerError::Interrupted { .. }) => {
                guard.finish(Some(StopReason::Forced));
                Err(DispatchError::ToolFailed {
                    code: -1,
                    log: "flash aborted by stop request".into(),
                })
            }
            Err(error @ ContainerError::StartFailed { .. })
            | Err(error @ ContainerError::StartTimeout { .. }) => {
                guard.finish(None);
                Err(DispatchError::ContainerStart(error))
            }
            Err(error) => {
                guard.finish(None);
                Err(DispatchError::Container(error))
            }
        }
    }

    async fn exec_flash(
        &self,
        service: &str,
        command: &str,
        token: &CancellationToken,
    ) -> Result<ExecOutput, ContainerError> {
        tokio::select! {
            started = self.containers.ensure_running(service) => started?,
            _ = token.cancelled() => {
                return Err(ContainerError::Interrupted { container: service.to_string() });
            }
        }
        self.containers.exec(service, command, token).await
    }

    async fn start_session(
        &self,
        prepared: PreparedDispatch,
        command: String,
    ) -> Result<DispatchOutcome, DispatchError> {
        let lock = lock::try_acquire(&self.config.locks.dir, prepared.probe_id).map_err(
            |error| match error {
                LockError::Busy { probe_id } => DispatchError::ProbeBusy(probe_id),
                other => DispatchError::Lock(other),
            },
        )?;

        self.containers
            .ensure_running(&prepared.container_service)
            .await
            .map_err(DispatchError::ContainerStart)?;

        let server = self
            .containers
            .spawn_server(&prepared.container_service, &command)
            .await
            .map_err(DispatchError::Container)?;

        // The lock handle moves into the supervisor task; it is released
        // exactly once, when the session reaches STOPPED.
        Supervisor::spawn(
            prepared.probe_id,
            prepared.mode,
            server,
            prepared.ports,
            lock,
            self.containers.clone(),
            self.sessions.clone(),
        );

        tracing::info!(
            probe = prepared.probe_id,
            mode = %prepared.mode,
            port = prepared.ports.primary(prepared.mode),
            "session started"
        );

        Ok(DispatchOutcome::Started {
            mode: prepared.mode,
            ports: prepared.ports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{example, EXAMPLE};
    use crate::inventory::tests::FakeSource;
    use crate::inventory::UsbDevice;
    use pretty_assertions::assert_eq;

    fn devices() -> Vec<UsbDevice> {
        vec![
            UsbDevice {
                vid: 0x1366,
                pid: 0x0101,
                serial: Some("S1".into()),
            },
            UsbDevice {
                vid: 0x2e8a,
                pid: 0x000c,
                serial: Some("E6612345".into()),
            },
        ]
    }

    fn hub_with(devices: Vec<UsbDevice>, lock_dir: &Path) -> Hub {
        let mut config = example();
        config.locks.dir = lock_dir.to_path_buf();
        Hub::with_inventory(
            config,
            Inventory::with_source(Box::new(FakeSource(devices))),
        )
    }

    fn request(target: &str, probe: u16, mode: Mode) -> DispatchRequest {
        DispatchRequest {
            target: target.into(),
            probe,
            mode,
            transport: None,
        }
    }

    #[test]
    fn validation_order_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_with(devices(), dir.path());

        // 1. Unknown target wins over everything else.
        let err = hub
            .validate(&request("stm32f4", 99, Mode::Debug))
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTarget(t) if t == "stm32f4"));

        // 2. Unknown probe.
        let err = hub
            .validate(&request("nrf52840", 99, Mode::Debug))
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownProbe(99)));

        // 3. Incompatible interface: probe 2 is cmsis-dap, nrf52840 wants jlink.
        let err = hub
            .validate(&request("nrf52840", 2, Mode::Debug))
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::IncompatibleProbe {
                probe: 2,
                interface: ProbeInterface::CmsisDap,
                ..
            }
        ));
    }

    #[test]
    fn disconnected_probe_is_rejected_before_compatibility() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_with(vec![], dir.path());

        let err = hub
            .validate(&request("nrf52840", 2, Mode::Debug))
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProbeNotConnected(2)));
    }

    #[test]
    fn transport_defaults_and_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_with(devices(), dir.path());

        let prepared = hub.validate(&request("nrf52840", 1, Mode::Debug)).unwrap();
        assert_eq!(prepared.transport, Some(Transport::Swd));

        let mut req = request("nrf52840", 1, Mode::Debug);
        req.transport = Some(Transport::Jtag);
        assert_eq!(
            hub.validate(&req).unwrap().transport,
            Some(Transport::Jtag)
        );

        req.transport = Some(Transport::Sdi);
        let err = hub.validate(&req).unwrap_err();
        assert!(matches!(
            &err,
            DispatchError::InvalidTransport {
                transport: Transport::Sdi,
                ..
            }
        ));
        assert_eq!(err.status(), "InvalidTransport");
    }

    #[test]
    fn supplied_transport_without_policy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_with(devices(), dir.path());

        // rp2040 has no transport policy for cmsis-dap.
        let mut req = request("rp2040", 2, Mode::Debug);
        req.transport = Some(Transport::Swd);
        assert!(matches!(
            hub.validate(&req).unwrap_err(),
            DispatchError::InvalidTransport { .. }
        ));

        // Omitting the transport is fine; the template doesn't reference it.
        let prepared = hub.validate(&request("rp2040", 2, Mode::Debug)).unwrap();
        assert_eq!(prepared.transport, None);
    }

    #[test]
    fn missing_transport_policy_fails_when_template_needs_it() {
        let dir = tempfile::tempdir().unwrap();
        // rp2040 has no transport policy, but the default template now asks
        // for one.
        let raw = EXAMPLE.replace(
            "debug = \"openocd -f interface/cmsis-dap.cfg -c 'adapter serial {serial}' -c 'gdb_port {gdb_port}'\"",
            "debug = \"openocd -f interface/cmsis-dap.cfg -c 'transport select {transport}' -c 'gdb_port {gdb_port}'\"",
        );
        let mut config = crate::config::HubConfig::from_toml_str(&raw).unwrap();
        config.locks.dir = dir.path().to_path_buf();
        let hub = Hub::with_inventory(
            config,
            Inventory::with_source(Box::new(FakeSource(devices()))),
        );

        let err = hub
            .validate(&request("rp2040", 2, Mode::Debug))
            .unwrap_err();
        assert!(matches!(
            &err,
            DispatchError::Template(TemplateError::MissingValue { name }) if name == "transport"
        ));
        assert_eq!(err.status(), "TemplateError");
    }

    #[test]
    fn prepared_ports_follow_probe_id() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_with(devices(), dir.path());

        let prepared = hub.validate(&request("nrf52840", 1, Mode::Debug)).unwrap();
        assert_eq!(prepared.ports.gdb, 3331);
        assert_eq!(prepared.container_service, "jlink-p1");
    }

    #[tokio::test]
    async fn flash_without_firmware_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_with(devices(), dir.path());

        let err = hub
            .dispatch(request("nrf52840", 1, Mode::Flash), None)
            .await
            .unwrap_err();
        assert!(matches!(&err, DispatchError::InvalidRequest(_)));
        assert_eq!(err.status(), "InvalidRequest");
        // No lock survives a failed validation.
        assert!(lock::try_acquire(dir.path(), 1).is_ok());
    }

    #[tokio::test]
    async fn busy_probe_is_refused_without_queueing() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_with(devices(), dir.path());

        let held = lock::try_acquire(dir.path(), 1).unwrap();
        let err = hub
            .dispatch(request("nrf52840", 1, Mode::Debug), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProbeBusy(1)));
        drop(held);
    }

    #[tokio::test]
    async fn template_render_fails_closed_before_locking() {
        let dir = tempfile::tempdir().unwrap();
        // Debug template references {firmware_path}, which debug never has.
        let raw = EXAMPLE.replace(
            "debug = \"JLinkGDBServer -select usb={serial} -if {transport} -port {gdb_port} -telnet {telnet_port} -rtt {rtt_port}\"",
            "debug = \"JLinkGDBServer {firmware_path}\"",
        );
        let mut config = crate::config::HubConfig::from_toml_str(&raw).unwrap();
        config.locks.dir = dir.path().to_path_buf();
        let hub = Hub::with_inventory(
            config,
            Inventory::with_source(Box::new(FakeSource(devices()))),
        );

        let err = hub
            .dispatch(request("nrf52840", 1, Mode::Debug), None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), "TemplateError");
        // The lock was never taken.
        assert!(lock::try_acquire(dir.path(), 1).is_ok());
    }

    #[test]
    fn status_records_carry_session_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub_with(devices(), dir.path());

        let records = hub.status_records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.busy && r.session.is_none()));
    }

    #[test]
    fn error_status_strings_are_stable() {
        assert_eq!(
            DispatchError::ProbeBusy(1).status(),
            "ProbeBusy"
        );
        assert_eq!(
            DispatchError::ProbeNotConnected(1).status(),
            "ProbeNotConnected"
        );
        assert_eq!(
            DispatchError::UnknownTarget("x".into()).status(),
            "UnknownTarget"
        );
        assert_eq!(
            DispatchError::ToolFailed {
                code: 1,
                log: String::new()
            }
            .status(),
            "ToolFailed"
        );
    }
}
