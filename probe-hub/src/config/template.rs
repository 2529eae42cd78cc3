//! Command templates with a closed placeholder set.
//!
//! Templates come from the hub configuration and are rendered once per
//! dispatch. Rendering fails closed: a placeholder outside the known set or
//! one without a value for the current request aborts the dispatch instead
//! of producing a partial command line.

use serde::{Deserialize, Serialize};

use crate::config::Transport;

/// All placeholders a command template may reference.
pub const PLACEHOLDERS: &[&str] = &[
    "serial",
    "gdb_port",
    "telnet_port",
    "rtt_port",
    "print_port",
    "firmware_path",
    "device_path",
    "transport",
    "uart_baud",
];

/// A command line with `{placeholder}` markers, as written in the config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub String);

/// Errors produced while rendering a [`CommandTemplate`].
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum TemplateError {
    /// Unknown placeholder `{name}` in command template.
    UnknownPlaceholder {
        /// The offending placeholder name.
        name: String,
    },
    /// No value available for placeholder `{name}` in this request.
    MissingValue {
        /// The placeholder that had no value.
        name: String,
    },
    /// Unterminated placeholder in command template.
    Unterminated,
}

/// The values available to a single render.
///
/// Ports are always allocated before rendering, so they are not optional.
/// Everything else depends on the probe and the request mode.
#[derive(Debug, Clone, Default)]
pub struct TemplateValues {
    pub serial: Option<String>,
    pub gdb_port: u16,
    pub telnet_port: u16,
    pub rtt_port: u16,
    pub print_port: u16,
    pub firmware_path: Option<String>,
    pub device_path: Option<String>,
    pub transport: Option<Transport>,
    pub uart_baud: Option<u32>,
}

impl TemplateValues {
    fn get(&self, name: &str) -> Result<String, TemplateError> {
        if !PLACEHOLDERS.contains(&name) {
            return Err(TemplateError::UnknownPlaceholder { name: name.into() });
        }

        let value = match name {
            "serial" => self.serial.clone(),
            "gdb_port" => Some(self.gdb_port.to_string()),
            "telnet_port" => Some(self.telnet_port.to_string()),
            "rtt_port" => Some(self.rtt_port.to_string()),
            "print_port" => Some(self.print_port.to_string()),
            "firmware_path" => self.firmware_path.clone(),
            "device_path" => self.device_path.clone(),
            "transport" => self.transport.map(|t| t.as_str().to_string()),
            "uart_baud" => self.uart_baud.map(|b| b.to_string()),
            _ => unreachable!("placeholder set is closed"),
        };

        value.ok_or_else(|| TemplateError::MissingValue { name: name.into() })
    }
}

impl CommandTemplate {
    /// Returns the placeholder names referenced by this template, in order
    /// of appearance. Malformed templates yield an error at render time.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = self.0.as_str();
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start + 1..].find('}') else {
                break;
            };
            names.push(&rest[start + 1..start + 1 + len]);
            rest = &rest[start + 1 + len + 1..];
        }
        names
    }

    /// Substitutes every `{placeholder}` with its value.
    pub fn render(&self, values: &TemplateValues) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let Some(len) = rest[start + 1..].find('}') else {
                return Err(TemplateError::Unterminated);
            };
            let name = &rest[start + 1..start + 1 + len];
            out.push_str(&values.get(name)?);
            rest = &rest[start + 1 + len + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// True if the template references the given placeholder.
    pub fn references(&self, name: &str) -> bool {
        self.placeholders().contains(&name)
    }
}
