use serde::{Deserialize, Serialize};
use std::fmt;

/// The admission class of a request.
///
/// Each class has its own per-endpoint quota. `Short` is the default for
/// ordinary downloads; `Long` is for streaming or otherwise persistent
/// connections, which are admitted against the smaller long-running quota so
/// they can never starve short requests of an endpoint's capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestClass {
    /// Seconds-scale request, admitted against the full endpoint capacity
    #[default]
    Short,
    /// Minutes-plus streaming request, admitted against the long-running quota
    Long,
}

impl fmt::Display for RequestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestClass::Short => write!(f, "short"),
            RequestClass::Long => write!(f, "long"),
        }
    }
}
