use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct DeviceMetrics {
    pub commands_written: IntCounter,
    pub reverts_written: IntCounter,
    pub reverts_skipped: IntCounter,
    pub status_changes: IntCounter,
    pub connect_failures: IntCounter,
    pub links_lost: IntCounter,
    pub audit_failures: IntCounter,
    pub devices_connected: IntGauge,
}

#[derive(Clone)]
pub struct SupervisorMetrics {
    pub registry: Registry,
    pub dev: DeviceMetrics,
}

impl SupervisorMetrics {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            IntCounter::new(name, help).map_err(|e| format!("metrics init error: {e}"))
        };
        let dev = DeviceMetrics {
            commands_written: counter("plc_commands_written", "Commands written to devices")?,
            reverts_written: counter(
                "plc_reverts_written",
                "Idle patterns written after momentary commands",
            )?,
            reverts_skipped: counter(
                "plc_reverts_skipped",
                "Reverts dropped because the device disconnected first",
            )?,
            status_changes: counter("plc_status_changes", "Observed status byte transitions")?,
            connect_failures: counter("plc_connect_failures", "Failed connection attempts")?,
            links_lost: counter("plc_links_lost", "Connections dropped after a poll failure")?,
            audit_failures: counter("plc_audit_failures", "Audit records that failed to persist")?,
            devices_connected: IntGauge::new("plc_devices_connected", "Devices currently connected")
                .map_err(|e| format!("metrics init error: {e}"))?,
        };
        let _ = registry.register(Box::new(dev.commands_written.clone()));
        let _ = registry.register(Box::new(dev.reverts_written.clone()));
        let _ = registry.register(Box::new(dev.reverts_skipped.clone()));
        let _ = registry.register(Box::new(dev.status_changes.clone()));
        let _ = registry.register(Box::new(dev.connect_failures.clone()));
        let _ = registry.register(Box::new(dev.links_lost.clone()));
        let _ = registry.register(Box::new(dev.audit_failures.clone()));
        let _ = registry.register(Box::new(dev.devices_connected.clone()));
        Ok(Self { registry, dev })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
