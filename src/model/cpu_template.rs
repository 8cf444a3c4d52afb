use serde::{Deserialize, Serialize};

use crate::utils::Json;

/// Static CPU templates shipped with firecracker. Templates mask CPUID
/// features so that a fleet of heterogeneous hosts exposes an identical
/// processor to every guest.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CPUTemplate {
    #[serde(rename = "C3")]
    C3,
    #[serde(rename = "T2")]
    T2,
    #[serde(rename = "T2S")]
    T2S,
    #[serde(rename = "T2CL")]
    T2CL,
    #[serde(rename = "T2A")]
    T2A,
    #[serde(rename = "V1N1")]
    V1N1,
    #[serde(rename = "None")]
    None,
}

impl<'a> Json<'a> for CPUTemplate {
    type Item = CPUTemplate;
}
