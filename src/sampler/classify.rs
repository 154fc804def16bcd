//! Stable response codes for outcome reporting. Downstream aggregation
//! groups failures by these, independent of locale or message text.

/// Successful sample.
pub const RESPONSE_CODE_OK: &str = "200";
/// Transport/IO failure.
pub const RESPONSE_CODE_IO: &str = "100";
/// Cooperative interruption while waiting for a delivery.
pub const RESPONSE_CODE_INTERRUPTED: &str = "200";
/// Broker-initiated consumer cancellation.
pub const RESPONSE_CODE_CANCELLED: &str = "300";
/// Broker shutdown signal or dead connection/channel state.
pub const RESPONSE_CODE_SHUTDOWN: &str = "400";
/// Catch-all for anything else during initialization or consume.
pub const RESPONSE_CODE_GENERIC: &str = "500";
/// Publish failure.
pub const RESPONSE_CODE_PUBLISH_FAILED: &str = "000";

/// Map a client error to its outcome code.
pub fn classify(error: &lapin::Error) -> &'static str {
    match error {
        lapin::Error::IOError(_) => RESPONSE_CODE_IO,
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::MissingHeartbeatError
        | lapin::Error::ProtocolError(_) => RESPONSE_CODE_SHUTDOWN,
        _ => RESPONSE_CODE_GENERIC,
    }
}
