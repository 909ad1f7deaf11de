use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FleetError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("configuration declares no {what}")]
    #[diagnostic(help("add at least one [hypervisors.<name>] and one [vms.<name>] table"))]
    EmptyConfig { what: &'static str },

    #[error("no hypervisors selected for probing")]
    NoHosts,

    #[error("hypervisor '{host}' is unreachable: {reason}")]
    #[diagnostic(help("pass --ignore-unreachable to continue without this host"))]
    Unreachable { host: String, reason: String },

    #[error("unknown hypervisor '{name}'")]
    UnknownHost { name: String },

    #[error("unknown VM '{name}'")]
    UnknownVm { name: String },

    #[error("'{name}' exists on several hypervisors ({hosts})")]
    #[diagnostic(help("destroy the unwanted instance with `esxctl destroy <host>/<vm>`"))]
    Collision { name: String, hosts: String },

    #[error("interrupted")]
    Cancelled,

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },
}
