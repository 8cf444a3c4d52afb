use serde::{Deserialize, Serialize};

use crate::utils::Json;

/// Defines the microVM running state. It is especially useful in the
/// snapshotting context.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Vm {
    /// state
    /// Required: true
    /// Enum: [Paused Resumed]
    #[serde(rename = "state")]
    pub state: VmState,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Paused,
    Resumed,
}

impl<'a> Json<'a> for Vm {
    type Item = Vm;
}

pub const VM_STATE_PAUSED: Vm = Vm {
    state: VmState::Paused,
};
pub const VM_STATE_RESUMED: Vm = Vm {
    state: VmState::Resumed,
};
