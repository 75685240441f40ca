//! plc-supervisor: connection lifecycle, momentary commands, status polling and
//! audit trail for a fleet of register-addressed PLCs

mod types;
pub use types::*;

mod error;
pub use error::{AuditError, ConfigError, ConnectError, RegistryError, WriteError};

mod loader;
pub use loader::{group_device_id, load_config_file, load_config_str, validate_profile, PlannedDevice};

mod decode;
pub use decode::{decode, indicators, StatusIndicator, NOT_CONNECTED_LABEL};

pub mod audit;
pub use audit::{AuditEntry, AuditLog, AuditRecord, MemoryAuditLog, TracingAuditLog};
#[cfg(feature = "sqlite")]
pub use audit::SqliteAuditLog;

mod metrics;
pub use metrics::{DeviceMetrics, SupervisorMetrics};

mod controller;
pub use controller::{DeviceController, DeviceSnapshot, SupervisorContext};

mod registry;
pub use registry::{ConnectReport, DeviceRegistry, LinkFactory};

pub use plc_link::{DeviceLink, LinkError, Register};
