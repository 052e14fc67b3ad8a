use std::time::SystemTime;

/// Handle errors
pub mod error;

/// Offset between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01)
pub const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Current time as Unix seconds.
///
/// FDT `Expires` attributes and the `mbms2007:Expires` element are stamped
/// with whatever the caller passes to `send()`. Callers talking to a peer
/// that expects NTP time should add [`NTP_UNIX_OFFSET`] themselves, see
/// [`unix_to_ntp`].
pub fn seconds_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Convert Unix seconds to NTP-epoch seconds
pub fn unix_to_ntp(unix_seconds: u64) -> u64 {
    unix_seconds + NTP_UNIX_OFFSET
}

#[cfg(test)]
mod tests {
    #[test]
    pub fn test_ntp_offset() {
        assert_eq!(super::unix_to_ntp(0), super::NTP_UNIX_OFFSET);
        assert!(super::seconds_since_epoch() > 1_600_000_000);
    }
}
