use log::error;
use serde::{Deserialize, Serialize};

use crate::{components::machine::MachineError, utils::Json};

use super::cpu_template::CPUTemplate;

/// The microVM processor and memory configuration.
///
/// # Example
///
/// ```
/// use firevisor::model::cpu_template::CPUTemplate;
/// use firevisor::model::machine_configuration::MachineConfiguration;
/// let machine_config = MachineConfiguration::default()
///     .with_cpu_template(&CPUTemplate::T2)
///     .with_vcpu_count(8)
///     .with_mem_size_mib(1024)
///     .set_smt(true);
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MachineConfiguration {
    /// cpu template
    #[serde(rename = "cpu_template", skip_serializing_if = "Option::is_none")]
    pub cpu_template: Option<CPUTemplate>,

    /// Flag for enabling/disabling simultaneous multithreading
    #[serde(rename = "smt", skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,

    /// Memory size of VM
    /// Required: true
    #[serde(rename = "mem_size_mib")]
    pub mem_size_mib: isize,

    /// Enable dirty page tracking.
    /// If this is enabled, then incremental guest memory snapshots can be
    /// created. These belong to diff snapshots, which contain, besides the
    /// microVM state, only the memory dirtied since a previous snapshot.
    #[serde(rename = "track_dirty_pages", skip_serializing_if = "Option::is_none")]
    pub track_dirty_pages: Option<bool>,

    /// Number of vCPUs (either 1 or an even number)
    /// Required: true
    /// Maximum: 32
    /// Minimum: 1
    #[serde(rename = "vcpu_count")]
    pub vcpu_count: isize,
}

impl<'a> Json<'a> for MachineConfiguration {
    type Item = MachineConfiguration;
}

impl Default for MachineConfiguration {
    fn default() -> Self {
        Self {
            cpu_template: None,
            smt: Some(false),
            mem_size_mib: 0,
            track_dirty_pages: None,
            vcpu_count: 0,
        }
    }
}

impl MachineConfiguration {
    pub fn with_cpu_template(mut self, cpu_template: &CPUTemplate) -> Self {
        self.cpu_template = Some(cpu_template.to_owned());
        self
    }

    pub fn set_smt(mut self, b: bool) -> Self {
        self.smt = Some(b);
        self
    }

    pub fn with_mem_size_mib(mut self, m: isize) -> Self {
        self.mem_size_mib = m;
        self
    }

    pub fn set_track_dirty_pages(mut self, b: bool) -> Self {
        self.track_dirty_pages = Some(b);
        self
    }

    pub fn with_vcpu_count(mut self, c: isize) -> Self {
        self.vcpu_count = c;
        self
    }

    pub fn get_vcpu_count(&self) -> isize {
        self.vcpu_count
    }

    pub fn is_smt_enabled(&self) -> bool {
        self.smt.unwrap_or(false)
    }

    pub fn get_mem_size_in_mib(&self) -> isize {
        self.mem_size_mib
    }

    #[must_use = "must validate MachineConfiguration before putting it to microVM"]
    pub fn validate(&self) -> Result<(), MachineError> {
        if self.vcpu_count < 1 {
            error!(target: "MachineConfiguration::validate", "machine needs a non-zero vcpu count");
            return Err(MachineError::Validation(
                "machine needs a non-zero vcpu count".to_string(),
            ));
        }
        if self.mem_size_mib < 1 {
            error!(target: "MachineConfiguration::validate", "machine needs a non-zero amount of memory");
            return Err(MachineError::Validation(
                "machine needs a non-zero amount of memory".to_string(),
            ));
        }

        Ok(())
    }
}
