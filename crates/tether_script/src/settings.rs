//! Runtime settings

use serde::{Deserialize, Serialize};

use crate::output::CapturePolicy;

/// Per-runtime configuration, serializable so hosts can load it from their
/// own config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Upper bound on engine heap usage in bytes. `None` means unbounded.
    pub memory_limit: Option<usize>,
    /// Retention policy for captured `print` output.
    pub capture: CapturePolicy,
    /// Also forward each `print` line to the tracing log.
    pub log_prints: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            memory_limit: None,
            capture: CapturePolicy::Unlimited,
            log_prints: false,
        }
    }
}
