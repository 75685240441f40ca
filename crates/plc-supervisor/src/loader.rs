use crate::error::ConfigError;
use crate::types::{DeploymentConfig, DeviceProfile};
use anyhow::Context;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// A device the configuration asks for, with its id already derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDevice {
    pub id: String,
    pub address: String,
    pub profile: String,
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<DeploymentConfig> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
    load_config_str(&raw).with_context(|| format!("loading config: {}", path.display()))
}

pub fn load_config_str(raw: &str) -> anyhow::Result<DeploymentConfig> {
    let config: DeploymentConfig = serde_yaml::from_str(raw).context("parsing yaml")?;
    config.validate().context("validating deployment")?;
    Ok(config)
}

/// Id of the `index`-th (0-based) device of a group.
pub fn group_device_id(type_name: &str, index: usize) -> String {
    format!("{}{}", type_name, index + 1)
}

impl DeploymentConfig {
    /// Devices in registration order: groups first, then explicit devices.
    pub fn planned_devices(&self) -> Vec<PlannedDevice> {
        let mut out = Vec::new();
        for group in &self.groups {
            for (i, address) in group.addresses.iter().enumerate() {
                out.push(PlannedDevice {
                    id: group_device_id(&group.type_name, i),
                    address: address.clone(),
                    profile: group.profile.clone(),
                });
            }
        }
        for dev in &self.devices {
            out.push(PlannedDevice {
                id: dev.id.clone(),
                address: dev.address.clone(),
                profile: dev.profile.clone(),
            });
        }
        out
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, profile) in &self.profiles {
            validate_profile(name, profile)?;
        }
        for group in &self.groups {
            if group.addresses.is_empty() {
                return Err(ConfigError::EmptyGroup(group.type_name.clone()));
            }
            self.require_profile(&group.type_name, &group.profile)?;
        }
        for dev in &self.devices {
            self.require_profile(&dev.id, &dev.profile)?;
        }
        let mut seen = BTreeSet::new();
        for planned in self.planned_devices() {
            if !seen.insert(planned.id.clone()) {
                return Err(ConfigError::DuplicateId(planned.id));
            }
        }
        Ok(())
    }

    fn require_profile(&self, owner: &str, profile: &str) -> Result<(), ConfigError> {
        if self.profiles.contains_key(profile) {
            Ok(())
        } else {
            Err(ConfigError::UnknownProfile {
                owner: owner.to_string(),
                profile: profile.to_string(),
            })
        }
    }
}

pub fn validate_profile(name: &str, profile: &DeviceProfile) -> Result<(), ConfigError> {
    if let Some(bit) = profile.status_bits.keys().find(|b| **b > 7) {
        return Err(ConfigError::StatusBitOutOfRange {
            profile: name.to_string(),
            bit: *bit,
        });
    }
    if !profile.commands.contains_key(&profile.idle_command) {
        return Err(ConfigError::MissingIdleCommand {
            profile: name.to_string(),
            command: profile.idle_command.clone(),
        });
    }
    if let Some(list) = &profile.momentary {
        if let Some(cmd) = list.iter().find(|c| !profile.commands.contains_key(*c)) {
            return Err(ConfigError::UnknownMomentary {
                profile: name.to_string(),
                command: cmd.clone(),
            });
        }
    }
    if profile.command_register == profile.status_register {
        return Err(ConfigError::RegisterClash {
            profile: name.to_string(),
            register: profile.status_register.to_string(),
        });
    }
    Ok(())
}
