// Protocol version negotiation and N-1 support.
//
// Clients send a protocol version string (e.g. "tandem-sync.v1") in their
// `join` frame. The server rejects unsupported versions with an
// UPGRADE_REQUIRED reject. N-1 support is maintained for at least one
// release cycle.

use crate::error::{ErrorCode, RelayError};
use serde_json::json;
use tandem_common::protocol::ws::{CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};

/// Returns true if the given protocol version string is supported.
pub fn is_supported(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Returns the list of supported protocol versions (newest first).
pub fn supported_versions() -> &'static [&'static str] {
    SUPPORTED_PROTOCOL_VERSIONS
}

/// Validates a client-supplied protocol version. Returns a `RelayError`
/// with code `UPGRADE_REQUIRED` and `details.supported_versions` if it is
/// not supported.
pub fn require_supported(version: &str) -> Result<(), RelayError> {
    if is_supported(version) {
        Ok(())
    } else {
        Err(RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {version}"),
        )
        .with_details(json!({
            "requested_version": version,
            "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
            "current_version": CURRENT_PROTOCOL_VERSION,
        })))
    }
}

/// Version check for a `join` frame. Clients that omit the version speak
/// the current one.
pub fn negotiate(requested: Option<&str>) -> Result<&'static str, RelayError> {
    let Some(version) = requested else {
        return Ok(CURRENT_PROTOCOL_VERSION);
    };
    require_supported(version)?;

    Ok(SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|supported| *supported == version)
        .unwrap_or(CURRENT_PROTOCOL_VERSION))
}
