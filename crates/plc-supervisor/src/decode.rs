use crate::types::StatusLabels;
use serde::{Deserialize, Serialize};

/// Label of the single indicator reported for a device that is not connected.
pub const NOT_CONNECTED_LABEL: &str = "device not connected";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusIndicator {
    pub label: String,
    pub active: bool,
}

impl StatusIndicator {
    pub fn new(label: impl Into<String>, active: bool) -> Self {
        Self {
            label: label.into(),
            active,
        }
    }

    pub fn not_connected() -> Self {
        Self::new(NOT_CONNECTED_LABEL, false)
    }
}

/// Split a status byte into labeled indicators, in ascending bit order.
///
/// Only bits present in `labels` are reported; bit 0 is the least significant.
/// Indices above 7 cannot be set in a byte and are skipped.
pub fn decode(status: u8, labels: &StatusLabels) -> Vec<StatusIndicator> {
    labels
        .iter()
        .filter(|(bit, _)| **bit < 8)
        .map(|(bit, label)| StatusIndicator::new(label.clone(), (status >> *bit) & 1 == 1))
        .collect()
}

/// Like [`decode`], but a disconnected device yields only the sentinel indicator.
pub fn indicators(connected: bool, status: u8, labels: &StatusLabels) -> Vec<StatusIndicator> {
    if connected {
        decode(status, labels)
    } else {
        vec![StatusIndicator::not_connected()]
    }
}
