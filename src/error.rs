use std::io::ErrorKind;

use crate::manifest::{BundleId, ManifestError};

/// The failure carried by a finished operation.
///
/// Cloneable so that every caller sharing a single-flight operation observes the same value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// A fetch failed and its retry budget is spent.
    #[error("failed to fetch {url} after {attempts} attempt(s): {message}")]
    Fetch {
        url: String,
        attempts: u32,
        message: String,
    },
    #[error("{context}: {message} ({kind:?})")]
    Io {
        context: String,
        kind: ErrorKind,
        message: String,
    },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("{what} verification failed: {message}")]
    Verification { what: String, message: String },
    #[error("operation aborted")]
    Aborted,
    #[error("{operation} did not complete within {iterations} synchronous updates")]
    Timeout { operation: String, iterations: u32 },
    /// Context wrapper naming the bundle and the step that failed.
    #[error("bundle {bundle} failed while {step}: {source}")]
    Bundle {
        bundle: String,
        step: &'static str,
        source: Box<OperationError>,
    },
    #[error("bundle loader for {0} was destroyed")]
    Destroyed(String),
    #[error("load operations are locked")]
    Locked,
    #[error("no asset at location {0}")]
    AssetNotFound(String),
    #[error("asset {asset} is not stored in bundle {bundle}")]
    AssetNotInBundle { asset: String, bundle: String },
    #[error("bundle {0} is not loaded")]
    NotLoaded(String),
    #[error("no bundle with id {0}")]
    UnknownBundle(BundleId),
    #[error("failed to decode {asset}: {message}")]
    Decode { asset: String, message: String },
    #[error("package {0} has no manifest installed")]
    NoManifest(String),
    #[error("package {0} has no remote to download from")]
    Offline(String),
}

impl OperationError {
    pub fn io(context: impl Into<String>, err: &std::io::Error) -> OperationError {
        OperationError::Io {
            context: context.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn in_bundle(self, bundle: impl Into<String>, step: &'static str) -> OperationError {
        OperationError::Bundle {
            bundle: bundle.into(),
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, below any context wrappers.
    pub fn root(&self) -> &OperationError {
        match self {
            OperationError::Bundle { source, .. } => source.root(),
            other => other,
        }
    }

    /// Aborts are not failures a user should be shown.
    pub fn is_aborted(&self) -> bool {
        matches!(self.root(), OperationError::Aborted)
    }

    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            OperationError::Fetch { .. } | OperationError::Io { .. } | OperationError::Verification { .. }
        )
    }

    /// A stable identifier for display and for host retry flows.
    pub fn code(&self) -> &'static str {
        match self.root() {
            OperationError::Fetch { .. } => "fetch_failed",
            OperationError::Io { .. } => "io_failed",
            OperationError::Manifest(m) => match m {
                ManifestError::EmptyBuffer => "manifest_empty",
                ManifestError::InvalidSignature { .. } => "manifest_invalid_signature",
                ManifestError::IncompatibleVersion { .. } => "manifest_incompatible_version",
                ManifestError::AddressableWithLowercase
                | ManifestError::ReplacePathWithoutAddressable
                | ManifestError::UnknownNameStyle(_) => "manifest_invalid_config",
                ManifestError::Restore(_) => "manifest_restore_failed",
                _ => "manifest_malformed",
            },
            OperationError::Verification { .. } => "verification_failed",
            OperationError::Aborted => "aborted",
            OperationError::Timeout { .. } => "timeout",
            OperationError::Destroyed(_) => "loader_destroyed",
            OperationError::Locked => "load_locked",
            OperationError::AssetNotFound(_) => "asset_not_found",
            OperationError::AssetNotInBundle { .. } => "asset_not_in_bundle",
            OperationError::NotLoaded(_) => "bundle_not_loaded",
            OperationError::UnknownBundle(_) => "bundle_not_found",
            OperationError::Decode { .. } => "decode_failed",
            OperationError::NoManifest(_) => "manifest_not_loaded",
            OperationError::Offline(_) => "package_offline",
            OperationError::Bundle { .. } => unreachable!("root() never returns a wrapper"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_keeps_root() {
        let err = OperationError::Aborted
            .in_bundle("ui.bundle", "downloading")
            .in_bundle("level.bundle", "loading dependencies");
        assert!(err.is_aborted());
        assert_eq!(err.code(), "aborted");
        assert_eq!(
            err.to_string(),
            "bundle level.bundle failed while loading dependencies: bundle ui.bundle failed while downloading: operation aborted"
        );
    }

    #[test]
    fn test_codes() {
        let fetch = OperationError::Fetch {
            url: "http://cdn/a".into(),
            attempts: 3,
            message: "timed out".into(),
        };
        assert_eq!(fetch.code(), "fetch_failed");
        assert!(fetch.is_retryable());
        assert!(!fetch.is_aborted());

        let format: OperationError = ManifestError::InvalidSignature { found: 1 }.into();
        assert_eq!(format.code(), "manifest_invalid_signature");
        assert!(!format.is_retryable());

        let io = OperationError::io(
            "reading ui.bundle",
            &std::io::Error::new(ErrorKind::NotFound, "missing"),
        );
        assert_eq!(io.code(), "io_failed");
        assert!(io.to_string().starts_with("reading ui.bundle: missing"));
    }
}
