//! Host configuration
//!
//! Retry budgets, NAK limits and bus timings. The defaults follow the
//! USB 2.0 minimums, with one millisecond of margin on each delay.

/// Minimum bus reset signalling time, in milliseconds
pub const MIN_RESET_TIME_MS: u16 = 50;
/// Minimum resume signalling time, in milliseconds
pub const MIN_RESUME_TIME_MS: u16 = 20;
/// Minimum resume recovery time, in milliseconds
pub const MIN_RESUME_RECOVERY_MS: u16 = 10;

/// Configures a [`Host`](crate::Host)
///
/// Use [`HostConfig::new`] or `Default` to get the defaults, then override
/// the fields you care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    /// Tries per enumeration command before the enumeration restarts
    pub command_tries: u8,
    /// Enumeration restarts before the device is held with
    /// [`HoldReason::CannotEnumerate`](crate::HoldReason::CannotEnumerate)
    pub enumeration_tries: u8,
    /// NAKs tolerated on a control endpoint
    pub control_naks: u16,
    /// NAKs tolerated on a bulk endpoint
    pub bulk_naks: u16,
    /// NAKs tolerated on an interrupt OUT endpoint
    pub interrupt_naks: u16,
    /// Transaction errors tolerated before a transfer fails
    pub transaction_retries: u8,
    /// Settle time after attach
    pub insert_time_ms: u16,
    /// Bus reset signalling time; never less than [`MIN_RESET_TIME_MS`]
    pub reset_time_ms: u16,
    /// Wait after the bus reset
    pub reset_recovery_ms: u16,
    /// Wait after SET_ADDRESS
    pub set_address_recovery_ms: u16,
    /// Resume signalling time; never less than [`MIN_RESUME_TIME_MS`]
    pub resume_time_ms: u16,
    /// Wait after resume; never less than [`MIN_RESUME_RECOVERY_MS`]
    pub resume_recovery_ms: u16,
    /// Limit on the control status stage, or `None` to wait forever
    pub control_status_timeout_ms: Option<u16>,
    /// VBUS current requested before a device is attached, in mA
    pub initial_vbus_current_ma: u16,
    /// Most VBUS current the root port can supply, in mA
    pub max_vbus_current_ma: u16,
    /// Most tokens issued in one frame
    pub transactions_per_frame: u8,
}

impl HostConfig {
    pub const fn new() -> Self {
        HostConfig {
            command_tries: 3,
            enumeration_tries: 3,
            control_naks: 20,
            bulk_naks: 10_000,
            interrupt_naks: 3,
            transaction_retries: 20,
            insert_time_ms: 250 + 1,
            reset_time_ms: MIN_RESET_TIME_MS + 1,
            reset_recovery_ms: 100 + 1,
            set_address_recovery_ms: 2,
            resume_time_ms: MIN_RESUME_TIME_MS + 1,
            resume_recovery_ms: MIN_RESUME_RECOVERY_MS + 1,
            control_status_timeout_ms: Some(45),
            initial_vbus_current_ma: 100,
            max_vbus_current_ma: 500,
            transactions_per_frame: 16,
        }
    }

    pub(crate) fn reset_time(&self) -> u16 {
        self.reset_time_ms.max(MIN_RESET_TIME_MS)
    }

    pub(crate) fn resume_time(&self) -> u16 {
        self.resume_time_ms.max(MIN_RESUME_TIME_MS)
    }

    pub(crate) fn resume_recovery(&self) -> u16 {
        self.resume_recovery_ms.max(MIN_RESUME_RECOVERY_MS)
    }

    pub(crate) fn command_tries(&self) -> u8 {
        self.command_tries.max(1)
    }

    pub(crate) fn enumeration_tries(&self) -> u8 {
        self.enumeration_tries.max(1)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}
