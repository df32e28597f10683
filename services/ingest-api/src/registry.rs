use crate::store::{StoreError, TelemetryStore};
use crate::types::ResolvedDevice;

/// Maps an external device id to its internal key, registering the device on
/// first sight.
pub fn resolve_device(
    store: &dyn TelemetryStore,
    external_id: &str,
) -> Result<ResolvedDevice, StoreError> {
    let resolved = store.resolve_device(external_id)?;
    if resolved.created {
        tracing::info!(device_id = %external_id, key = resolved.key.0, "device registered");
    } else {
        tracing::debug!(device_id = %external_id, key = resolved.key.0, "device resolved");
    }
    Ok(resolved)
}
