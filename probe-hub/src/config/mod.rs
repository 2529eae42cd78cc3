//! The declarative hardware/target catalog.
//!
//! A single document (TOML, YAML or JSON, merged with `PROBE_HUB_*`
//! environment overrides) describes the attached probes, the toolchain
//! containers, the MCU targets and their command templates. The model is
//! validated once at load time and immutable afterwards; per-dispatch
//! resolution is a pure lookup over it.

pub mod template;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use figment::providers::{Env, Format as _, Json, Toml, Yaml};
use figment::Figment;
use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ports::PortsSection;
pub use template::{CommandTemplate, TemplateError, TemplateValues};

/// The hardware protocol class of a probe, independent of tool choice.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeInterface {
    Jlink,
    CmsisDap,
    WchLink,
    UsbUart,
    EspUsbJtag,
    Rp2040Bootsel,
}

impl ProbeInterface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jlink => "jlink",
            Self::CmsisDap => "cmsis-dap",
            Self::WchLink => "wch-link",
            Self::UsbUart => "usb-uart",
            Self::EspUsbJtag => "esp-usb-jtag",
            Self::Rp2040Bootsel => "rp2040-bootsel",
        }
    }
}

impl fmt::Display for ProbeInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeInterface {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jlink" => Ok(Self::Jlink),
            "cmsis-dap" => Ok(Self::CmsisDap),
            "wch-link" => Ok(Self::WchLink),
            "usb-uart" => Ok(Self::UsbUart),
            "esp-usb-jtag" => Ok(Self::EspUsbJtag),
            "rp2040-bootsel" => Ok(Self::Rp2040Bootsel),
            _ => Err(format!("unknown probe interface '{s}'")),
        }
    }
}

/// What a dispatch asks the hub to do with a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Flash,
    Debug,
    Print,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flash => "flash",
            Self::Debug => "debug",
            Self::Print => "print",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flash" => Ok(Self::Flash),
            "debug" => Ok(Self::Debug),
            "print" => Ok(Self::Print),
            _ => Err(format!("unknown mode '{s}'")),
        }
    }
}

/// The on-wire signaling selected inside a given interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Swd,
    Jtag,
    Sdi,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Swd => "swd",
            Self::Jtag => "jtag",
            Self::Sdi => "sdi",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swd" => Ok(Self::Swd),
            "jtag" => Ok(Self::Jtag),
            "sdi" => Ok(Self::Sdi),
            _ => Err(format!("unknown transport '{s}'")),
        }
    }
}

/// A USB vendor or product id.
///
/// Parsed from hex with or without a `0x` prefix, in either case; rendered
/// as four lowercase hex digits. Matching is numeric, so hex case in the
/// config never affects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId(pub u16);

impl UsbId {
    pub fn parse(s: &str) -> Result<Self, String> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() || digits.len() > 4 {
            return Err(format!("'{s}' is not a valid USB id"));
        }
        u16::from_str_radix(digits, 16)
            .map(UsbId)
            .map_err(|_| format!("'{s}' is not a valid USB id"))
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl FromStr for UsbId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for UsbId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UsbId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        UsbId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// One physical debug adapter, as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeSpec {
    /// Unique id, used for lock and port keying.
    pub id: u16,
    /// Human readable name.
    pub name: String,
    /// Vendor-assigned serial, when the adapter reports one.
    #[serde(default)]
    pub serial: Option<String>,
    pub vid: UsbId,
    pub pid: UsbId,
    pub interface: ProbeInterface,
    /// Stable device-node override (the udev collaborator's symlink).
    #[serde(default)]
    pub device: Option<PathBuf>,
    /// Baud rate fed to `{uart_baud}`; only meaningful for UART probes.
    #[serde(default)]
    pub uart_baud: Option<u32>,
}

impl ProbeSpec {
    /// The device path exposed to command templates.
    pub fn device_path(&self) -> PathBuf {
        self.device
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/dev/probes/probe_{}", self.id)))
    }
}

/// A toolchain container image and its naming scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerSpec {
    /// Container image identifier.
    pub image: String,
    /// Build context for the external image builder.
    #[serde(default)]
    pub build: Option<PathBuf>,
    /// Base of the runtime container name; defaults to the config key.
    #[serde(default)]
    pub base: Option<String>,
}

impl ContainerSpec {
    /// Runtime container name for the given probe: `<base>-p<probeId>`.
    pub fn runtime_name(&self, key: &str, probe_id: u16) -> String {
        format!("{}-p{probe_id}", self.base.as_deref().unwrap_or(key))
    }
}

/// Container selection for a target: one container for every interface, or
/// a per-interface map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContainerSelect {
    Single(String),
    PerInterface(BTreeMap<ProbeInterface, String>),
}

/// The interface kinds a target accepts, per mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompatibleProbes {
    pub debug: Vec<ProbeInterface>,
    pub flash: Vec<ProbeInterface>,
    pub print: Vec<ProbeInterface>,
}

impl CompatibleProbes {
    pub fn for_mode(&self, mode: Mode) -> &[ProbeInterface] {
        match mode {
            Mode::Debug => &self.debug,
            Mode::Flash => &self.flash,
            Mode::Print => &self.print,
        }
    }

    /// Every interface named by any mode, deduplicated.
    pub fn all(&self) -> Vec<ProbeInterface> {
        let mut set: Vec<ProbeInterface> = Vec::new();
        for interface in self.debug.iter().chain(&self.flash).chain(&self.print) {
            if !set.contains(interface) {
                set.push(*interface);
            }
        }
        set
    }
}

/// Transport policy for one interface of a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportPolicy {
    pub default: Transport,
    pub allowed: Vec<Transport>,
}

/// Command templates per mode, for one interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModeCommands {
    pub debug: Option<CommandTemplate>,
    pub flash: Option<CommandTemplate>,
    pub print: Option<CommandTemplate>,
}

impl ModeCommands {
    pub fn for_mode(&self, mode: Mode) -> Option<&CommandTemplate> {
        match mode {
            Mode::Debug => self.debug.as_ref(),
            Mode::Flash => self.flash.as_ref(),
            Mode::Print => self.print.as_ref(),
        }
    }
}

/// A named MCU family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSpec {
    #[serde(default)]
    pub description: String,
    pub container: ContainerSelect,
    pub compatible_probes: CompatibleProbes,
    #[serde(default)]
    pub transports: BTreeMap<ProbeInterface, TransportPolicy>,
    #[serde(default)]
    pub commands: BTreeMap<ProbeInterface, ModeCommands>,
}

impl TargetSpec {
    /// The container key serving the given interface, if any.
    pub fn container_for(&self, interface: ProbeInterface) -> Option<&str> {
        match &self.container {
            ContainerSelect::Single(name) => Some(name),
            ContainerSelect::PerInterface(map) => map.get(&interface).map(String::as_str),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0".into()
}

fn default_http_port() -> u16 {
    3000
}

/// HTTP bind options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_http_port(),
        }
    }
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/tmp/flash_staging")
}

fn default_max_upload_size() -> u64 {
    64 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    ["hex", "bin", "elf", "uf2"].map(String::from).to_vec()
}

/// Firmware staging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagingSection {
    /// Directory bind-mounted into every toolchain container at the same path.
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for StagingSection {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
            max_upload_size: default_max_upload_size(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/lock")
}

/// Probe lock file options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocksSection {
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
}

impl Default for LocksSection {
    fn default() -> Self {
        Self {
            dir: default_lock_dir(),
        }
    }
}

/// The whole hub catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub staging: StagingSection,
    #[serde(default)]
    pub locks: LocksSection,
    /// Compose descriptor passed to the container runtime; the runtime's
    /// default lookup applies when unset.
    #[serde(default)]
    pub compose_file: Option<PathBuf>,
    pub containers: BTreeMap<String, ContainerSpec>,
    pub probes: Vec<ProbeSpec>,
    pub targets: BTreeMap<String, TargetSpec>,
    #[serde(default)]
    pub interface_defaults: BTreeMap<ProbeInterface, ModeCommands>,
    #[serde(default)]
    pub ports: PortsSection,
}

/// Errors from loading or validating the hub configuration.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ConfigError {
    /// Failed to load the hub configuration: {0}
    Load(#[from] Box<figment::Error>),
    /// Duplicate probe id {id}.
    DuplicateProbeId { id: u16 },
    /// Target `{target}` references undefined container `{container}`.
    UnknownContainer { target: String, container: String },
    /// Target `{target}` lists interface `{interface}` but selects no container for it.
    MissingContainer {
        target: String,
        interface: ProbeInterface,
    },
    /// Target `{target}` lists interface `{interface}` for {mode} but has no command for it, locally or in interface_defaults.
    MissingCommand {
        target: String,
        interface: ProbeInterface,
        mode: Mode,
    },
    /// Target `{target}`: default transport {default} for `{interface}` is not in its allowed list.
    DefaultTransportNotAllowed {
        target: String,
        interface: ProbeInterface,
        default: Transport,
    },
}

/// One `(toolchain, probe)` pair implied by the config; the external compose
/// generator materializes exactly these as services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposePair {
    pub container: String,
    pub probe_id: u16,
    pub service: String,
}

impl HubConfig {
    /// Loads the configuration from an explicit file, or from the default
    /// search locations, merged with `PROBE_HUB_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();

        match path {
            Some(path) => {
                figment = match path.extension().and_then(|e| e.to_str()) {
                    Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                    Some("json") => figment.merge(Json::file(path)),
                    _ => figment.merge(Toml::file(path)),
                };
            }
            None => {
                for dir in ["/etc/probe-hub", "."] {
                    let dir = Path::new(dir);
                    figment = figment
                        .merge(Toml::file(dir.join("probe-hub.toml")))
                        .merge(Json::file(dir.join("probe-hub.json")))
                        .merge(Yaml::file(dir.join("probe-hub.yaml")))
                        .merge(Yaml::file(dir.join("probe-hub.yml")));
                }
            }
        }

        let config: HubConfig = figment
            .merge(Env::prefixed("PROBE_HUB_").split("__"))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document. Mostly useful for tests and tooling; the
    /// server goes through [`HubConfig::load`].
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = Figment::from(Toml::string(raw))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the catalog's cross-references: unique probe ids, container
    /// references, command coverage for every compatible interface, and
    /// transport defaults. Called once by the loaders.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for probe in &self.probes {
            if !seen.insert(probe.id) {
                return Err(ConfigError::DuplicateProbeId { id: probe.id });
            }
        }

        for (name, target) in &self.targets {
            match &target.container {
                ContainerSelect::Single(container) => {
                    if !self.containers.contains_key(container) {
                        return Err(ConfigError::UnknownContainer {
                            target: name.clone(),
                            container: container.clone(),
                        });
                    }
                }
                ContainerSelect::PerInterface(map) => {
                    for container in map.values() {
                        if !self.containers.contains_key(container) {
                            return Err(ConfigError::UnknownContainer {
                                target: name.clone(),
                                container: container.clone(),
                            });
                        }
                    }
                }
            }

            for interface in target.compatible_probes.all() {
                if target.container_for(interface).is_none() {
                    return Err(ConfigError::MissingContainer {
                        target: name.clone(),
                        interface,
                    });
                }
            }

            for mode in [Mode::Flash, Mode::Debug, Mode::Print] {
                for &interface in target.compatible_probes.for_mode(mode) {
                    if self.resolve_command(target, interface, mode).is_none() {
                        return Err(ConfigError::MissingCommand {
                            target: name.clone(),
                            interface,
                            mode,
                        });
                    }
                }
            }

            for (&interface, policy) in &target.transports {
                if !policy.allowed.contains(&policy.default) {
                    return Err(ConfigError::DefaultTransportNotAllowed {
                        target: name.clone(),
                        interface,
                        default: policy.default,
                    });
                }
            }
        }

        self.warn_dead_interfaces();
        self.warn_port_spacing();
        Ok(())
    }

    /// The effective command template for `(target, interface, mode)`:
    /// target-local override first, then the interface default.
    pub fn resolve_command<'a>(
        &'a self,
        target: &'a TargetSpec,
        interface: ProbeInterface,
        mode: Mode,
    ) -> Option<&'a CommandTemplate> {
        target
            .commands
            .get(&interface)
            .and_then(|commands| commands.for_mode(mode))
            .or_else(move || {
                self.interface_defaults
                    .get(&interface)
                    .and_then(|commands| commands.for_mode(mode))
            })
    }

    pub fn probe(&self, id: u16) -> Option<&ProbeSpec> {
        self.probes.iter().find(|p| p.id == id)
    }

    pub fn target(&self, name: &str) -> Option<&TargetSpec> {
        self.targets.get(name)
    }

    /// Runtime container name for a `(container key, probe)` pair.
    pub fn container_runtime_name(&self, key: &str, probe_id: u16) -> Option<String> {
        self.containers
            .get(key)
            .map(|spec| spec.runtime_name(key, probe_id))
    }

    /// All compatible `(toolchain, probe)` pairs implied by the config.
    pub fn compose_pairs(&self) -> Vec<ComposePair> {
        self.probes
            .iter()
            .cartesian_product(self.targets.values())
            .filter_map(|(probe, target)| {
                if !target.compatible_probes.all().contains(&probe.interface) {
                    return None;
                }
                let key = target.container_for(probe.interface)?;
                let spec = self.containers.get(key)?;
                Some(ComposePair {
                    container: key.to_string(),
                    probe_id: probe.id,
                    service: spec.runtime_name(key, probe.id),
                })
            })
            .unique_by(|pair| (pair.container.clone(), pair.probe_id))
            .sorted_by(|a, b| (&a.container, a.probe_id).cmp(&(&b.container, b.probe_id)))
            .collect()
    }

    fn warn_dead_interfaces(&self) {
        let live: HashSet<ProbeInterface> = self
            .targets
            .values()
            .flat_map(|t| t.compatible_probes.all())
            .collect();
        for probe in &self.probes {
            if !live.contains(&probe.interface) {
                tracing::warn!(
                    probe = probe.id,
                    interface = %probe.interface,
                    "probe interface appears in no target's compatibility list; dead config"
                );
            }
        }
    }

    fn warn_port_spacing(&self) {
        let Some(max_id) = self.probes.iter().map(|p| p.id).max() else {
            return;
        };
        let bases = self.ports.bases();
        for (i, &(name_a, a)) in bases.iter().enumerate() {
            for &(name_b, b) in &bases[i + 1..] {
                if a.abs_diff(b) <= max_id {
                    tracing::warn!(
                        "{name_a} ({a}) and {name_b} ({b}) are spaced closer than the \
                         highest probe id ({max_id}); allocated ports may collide"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    pub(crate) const EXAMPLE: &str = r#"
        [containers.openocd]
        image = "probe-hub/openocd:latest"
        build = "containers/openocd"

        [containers.jlink]
        image = "probe-hub/jlink:latest"

        [[probes]]
        id = 1
        name = "J-Link on bench 1"
        serial = "S1"
        vid = "1366"
        pid = "0101"
        interface = "jlink"

        [[probes]]
        id = 2
        name = "Pico debug probe"
        vid = "0x2E8A"
        pid = "0x000C"
        interface = "cmsis-dap"

        [targets.nrf52840]
        description = "Nordic nRF52840"
        container = "jlink"

        [targets.nrf52840.compatible_probes]
        debug = ["jlink"]
        flash = ["jlink"]

        [targets.nrf52840.transports.jlink]
        default = "swd"
        allowed = ["swd", "jtag"]

        [targets.nrf52840.commands.jlink]
        debug = "JLinkGDBServer -select usb={serial} -if {transport} -port {gdb_port} -telnet {telnet_port} -rtt {rtt_port}"
        flash = "JLinkExe -AutoConnect 1 -CommandFile {firmware_path}.jlink"

        [targets.rp2040]
        description = "Raspberry Pi RP2040"
        container = "openocd"

        [targets.rp2040.compatible_probes]
        debug = ["cmsis-dap"]
        flash = ["cmsis-dap"]

        [interface_defaults.cmsis-dap]
        debug = "openocd -f interface/cmsis-dap.cfg -c 'adapter serial {serial}' -c 'gdb_port {gdb_port}'"
        flash = "openocd -f interface/cmsis-dap.cfg -c 'program {firmware_path} verify reset exit'"

        [ports]
        gdb_base = 3330
        telnet_base = 4440
        rtt_base = 19020
        print_base = 8880
    "#;

    pub(crate) fn example() -> HubConfig {
        HubConfig::from_toml_str(EXAMPLE).unwrap()
    }

    #[test]
    fn parses_and_validates_example() {
        let config = example();
        assert_eq!(config.probes.len(), 2);
        assert_eq!(config.probes[1].vid, UsbId(0x2e8a));
        assert_eq!(config.probes[1].pid, UsbId(0x000c));
        assert_eq!(config.probe(1).unwrap().serial.as_deref(), Some("S1"));
        assert!(config.target("nrf52840").is_some());
    }

    #[test]
    fn usb_id_accepts_hex_in_any_case() {
        for raw in ["2e8a", "2E8A", "0x2e8a", "0X2E8A"] {
            assert_eq!(UsbId::parse(raw).unwrap(), UsbId(0x2e8a));
        }
        assert_eq!(UsbId(0x2e8a).to_string(), "2e8a");
        assert!(UsbId::parse("probe").is_err());
        assert!(UsbId::parse("0x12345").is_err());
        assert!(UsbId::parse("").is_err());
    }

    #[test]
    fn resolution_prefers_target_local_command() {
        let config = example();
        let target = config.target("nrf52840").unwrap();
        let template = config
            .resolve_command(target, ProbeInterface::Jlink, Mode::Debug)
            .unwrap();
        assert!(template.0.starts_with("JLinkGDBServer"));

        let rp2040 = config.target("rp2040").unwrap();
        let fallback = config
            .resolve_command(rp2040, ProbeInterface::CmsisDap, Mode::Flash)
            .unwrap();
        assert!(fallback.0.starts_with("openocd"));
    }

    #[test]
    fn resolution_fails_for_unlisted_mode() {
        let config = example();
        let target = config.target("nrf52840").unwrap();
        assert!(config
            .resolve_command(target, ProbeInterface::Jlink, Mode::Print)
            .is_none());
    }

    #[test]
    fn rejects_duplicate_probe_ids() {
        let raw = EXAMPLE.replace("id = 2", "id = 1");
        let err = HubConfig::from_toml_str(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProbeId { id: 1 }));
    }

    #[test]
    fn rejects_unknown_container_reference() {
        let raw = EXAMPLE.replace("container = \"jlink\"", "container = \"riscv\"");
        let err = HubConfig::from_toml_str(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownContainer { .. }));
    }

    #[test]
    fn rejects_interface_without_command() {
        let raw = EXAMPLE.replace("debug = [\"cmsis-dap\"]", "debug = [\"wch-link\"]");
        let err = HubConfig::from_toml_str(&raw).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingCommand {
                interface: ProbeInterface::WchLink,
                mode: Mode::Debug,
                ..
            }
        ));
    }

    #[test]
    fn rejects_default_transport_outside_allowed() {
        let raw = EXAMPLE.replace("allowed = [\"swd\", \"jtag\"]", "allowed = [\"jtag\"]");
        let err = HubConfig::from_toml_str(&raw).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DefaultTransportNotAllowed {
                default: Transport::Swd,
                ..
            }
        ));
    }

    #[test_case("13666", false; "five digits")]
    #[test_case("0x1366", true; "prefixed")]
    #[test_case("1366", true; "bare")]
    #[test_case("g366", false; "not hex")]
    fn usb_id_parsing(raw: &str, ok: bool) {
        assert_eq!(UsbId::parse(raw).is_ok(), ok);
    }

    #[test]
    fn malformed_vid_is_rejected_at_load() {
        let raw = EXAMPLE.replace("vid = \"1366\"", "vid = \"xyzw\"");
        assert!(matches!(
            HubConfig::from_toml_str(&raw),
            Err(ConfigError::Load(_))
        ));
    }

    #[test]
    fn compose_pairs_cover_compatible_combinations() {
        let pairs = example().compose_pairs();
        assert_eq!(
            pairs,
            vec![
                ComposePair {
                    container: "jlink".into(),
                    probe_id: 1,
                    service: "jlink-p1".into(),
                },
                ComposePair {
                    container: "openocd".into(),
                    probe_id: 2,
                    service: "openocd-p2".into(),
                },
            ]
        );
    }

    #[test]
    fn runtime_names_follow_base_pattern() {
        let config = example();
        assert_eq!(
            config.container_runtime_name("openocd", 7).unwrap(),
            "openocd-p7"
        );
        let spec = ContainerSpec {
            image: "x".into(),
            build: None,
            base: Some("wch".into()),
        };
        assert_eq!(spec.runtime_name("wch-toolchain", 3), "wch-p3");
    }
}
