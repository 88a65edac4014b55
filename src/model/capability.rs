//! Startup probe for the gradient-boosted backend.
//!
//! The probe runs one tiny fit/predict cycle and classifies the outcome.
//! Callers run it once (at CLI startup) and pass the result into
//! [`crate::model::PipelineSpec::new`], so a missing backend surfaces as a
//! typed error with a remediation hint instead of a crash mid-training.

use std::fmt;

use crate::model::ModelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoostCapability {
    /// Backend compiled in and the probe fit succeeded.
    Available,
    /// Binary was built without the `boost` feature.
    NotInstalled,
    /// Backend is compiled in but a native library failed to load.
    NativeRuntimeMissing { detail: String },
    /// Probe failed for a reason the classifier does not recognize.
    Unknown { detail: String },
}

impl BoostCapability {
    /// Probe the boosted backend. Panics from the probe fit are caught and
    /// classified by payload, so a broken runtime degrades to a status value.
    pub fn probe() -> Self {
        #[cfg(feature = "boost")]
        {
            Self::probe_runtime()
        }
        #[cfg(not(feature = "boost"))]
        {
            Self::NotInstalled
        }
    }

    #[cfg(feature = "boost")]
    fn probe_runtime() -> Self {
        match std::panic::catch_unwind(crate::model::boost::smoke_test) {
            Ok(Ok(())) => Self::Available,
            Ok(Err(detail)) => Self::Unknown { detail },
            Err(payload) => {
                let detail = panic_detail(&payload);
                if looks_like_missing_library(&detail) {
                    Self::NativeRuntimeMissing { detail }
                } else {
                    Self::Unknown { detail }
                }
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    /// Short status label, also used in error messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::NotInstalled => "not installed",
            Self::NativeRuntimeMissing { .. } => "native runtime missing",
            Self::Unknown { .. } => "failed startup check",
        }
    }

    /// How to get from this state to `Available`.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::Available => None,
            Self::NotInstalled => Some(
                "Rebuild with the boost feature (cargo install pvcast --features boost) \
                 or train with --model rf."
                    .to_string(),
            ),
            Self::NativeRuntimeMissing { detail } => Some(format!(
                "Install the missing system library ({detail}); on Debian/Ubuntu try \
                 `apt install libgomp1`, on macOS `brew install libomp`. \
                 Or train with --model rf."
            )),
            Self::Unknown { detail } => Some(format!(
                "The boosted backend failed its startup check ({detail}). \
                 Rebuild with --features boost or train with --model rf."
            )),
        }
    }

    /// Fail unless the backend is available.
    pub fn require(&self) -> Result<(), ModelError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(self.to_error())
        }
    }

    pub(crate) fn to_error(&self) -> ModelError {
        ModelError::BoostUnavailable {
            reason: self.label().to_string(),
            remediation: self
                .remediation()
                .unwrap_or_else(|| "Train with --model rf.".to_string()),
        }
    }
}

impl fmt::Display for BoostCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available | Self::NotInstalled => f.write_str(self.label()),
            Self::NativeRuntimeMissing { detail } | Self::Unknown { detail } => {
                write!(f, "{} ({detail})", self.label())
            }
        }
    }
}

#[cfg(feature = "boost")]
fn panic_detail(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unrecognized panic payload".to_string()
    }
}

#[cfg(feature = "boost")]
fn looks_like_missing_library(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    ["library", ".so", ".dylib", ".dll", "symbol"]
        .iter()
        .any(|needle| lower.contains(needle))
}
