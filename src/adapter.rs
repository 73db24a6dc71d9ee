use crate::controller::{PortGuard, RecorderCore};

/// Information the adapter fills in during [`DigitizerAdapter::check_settings`].
#[derive(Debug)]
pub struct ArmInfo {
    /// Display sample rate for this arming, in Hz. Mandatory: arming fails
    /// if this is left at NaN or set to a non-finite value. It drives the
    /// time axis and is attached to every submitted channel burst.
    pub rate_for_display: f64,

    /// Custom pre/post sample counts for the time axis. When `None` the
    /// counts derive from the captured sample-number settings.
    pub custom_time_axis: Option<TimeAxisSpan>,
}

impl ArmInfo {
    pub(crate) fn new() -> Self {
        ArmInfo {
            rate_for_display: f64::NAN,
            custom_time_axis: None,
        }
    }
}

/// Pre/post sample counts for the time axis.
#[derive(Debug, Clone, Copy)]
pub struct TimeAxisSpan {
    pub num_pre: usize,
    pub num_post: usize,
}

/// Meta-information about one burst, for [`RecorderCore::publish_burst_meta`].
///
/// Timing fields are in microseconds; NaN means "not reported".
#[derive(Debug, Clone, Copy)]
pub struct BurstMeta {
    /// Burst identifier. Should increment by one per burst and wrap to zero
    /// well before `i32::MAX`.
    pub burst_id: i32,
    /// Duration of the burst.
    pub time_burst: f64,
    /// Time it took to read the burst out of the hardware.
    pub time_read: f64,
    /// Time it took to process the burst after reading.
    pub time_process: f64,
}

impl BurstMeta {
    pub fn new(burst_id: i32) -> Self {
        BurstMeta {
            burst_id,
            time_burst: f64::NAN,
            time_read: f64::NAN,
            time_process: f64::NAN,
        }
    }
}

/// Result of a successful [`DigitizerAdapter::check_overflow`] call.
#[derive(Debug, Clone, Copy)]
pub struct OverflowCheck {
    /// Whether a hardware buffer overflow has occurred.
    pub overflowed: bool,
    /// When `overflowed`, the number of bursts that can still be read out
    /// of the hardware buffer INCLUDING the burst just read. Must be
    /// positive; hardware that claims a power-of-two buffer often has one
    /// slot fewer of usable capacity, so count carefully.
    pub buffered_bursts: i32,
}

/// Hardware-specific callbacks invoked by the arming controller.
///
/// Every callback is documented with the state of the controller's port
/// lock on entry. "Locked" callbacks receive `&mut PortGuard` and, unless
/// noted otherwise, must not release it; "unlocked" callbacks receive
/// `&RecorderCore` and may call [`RecorderCore::lock`] themselves.
///
/// Errors do not cross this boundary as types: callbacks report failure by
/// returning `false` (or `None`) and are expected to log their own detail.
///
/// Adapters that do not use the built-in read loop must leave
/// [`read_burst`](Self::read_burst) and
/// [`interrupt_reading`](Self::interrupt_reading) at their defaults and
/// submit data from their own threads.
pub trait DigitizerAdapter: Send + Sync + 'static {
    /// Number of input channels of the digitizer.
    fn num_channels(&self) -> usize;

    /// Whether the hardware supports pre-trigger samples. Arming in
    /// pre-post-trigger mode is rejected when this is false.
    fn supports_pre_samples(&self) -> bool {
        false
    }

    /// The desired sample rate changed; recompute the achievable rate and
    /// report it with [`PortGuard::set_achievable_sample_rate`], either here
    /// or asynchronously (then `wait_for_preconditions` must wait for the
    /// computation to finish).
    ///
    /// Locked; must not release the lock.
    ///
    /// The default echoes the requested rate, which is rarely right for
    /// real hardware with a discrete set of clock rates.
    fn requested_sample_rate_changed(&self, port: &mut PortGuard<'_>) {
        let rate = port.requested_sample_rate();
        port.set_achievable_sample_rate(rate);
    }

    /// Wait for the preconditions of arming (pending clock calculations,
    /// links coming up, ...). Returning false aborts the arming with an
    /// error.
    ///
    /// Locked; may release temporarily through [`PortGuard::unlocked`] but
    /// must return with the lock held.
    fn wait_for_preconditions(&self, port: &mut PortGuard<'_>) -> bool {
        let _ = port;
        true
    }

    /// Validate the captured configuration snapshot and fill in `arm_info`.
    /// Snapshot values may be read from here on, and rewritten or marked
    /// irrelevant only from here. Returning false aborts the arming.
    ///
    /// Locked; must not release the lock.
    fn check_settings(&self, port: &mut PortGuard<'_>, arm_info: &mut ArmInfo) -> bool;

    /// Configure the hardware and start acquisition. Called once per arming
    /// with `overflow_restart == false`, and again with `true` for each
    /// restart while recovering from a buffer overflow (any hardware
    /// stop/start cycle the restart needs happens inside this call).
    ///
    /// Unlocked. After this has been called, successfully or not,
    /// [`stop_acquisition`](Self::stop_acquisition) will be called during
    /// disarm cleanup.
    fn start_acquisition(&self, core: &RecorderCore, overflow_restart: bool) -> bool;

    /// Wait for and read one burst of data. Must return true when
    /// interrupted by [`interrupt_reading`](Self::interrupt_reading); the
    /// caller does not distinguish interruption from success. Returning
    /// false aborts with an error.
    ///
    /// Unlocked.
    ///
    /// The default implementation, for adapters that do not use the
    /// built-in read loop, blocks until disarming is requested.
    fn read_burst(&self, core: &RecorderCore) -> bool {
        core.wait_until_disarming();
        true
    }

    /// Check for a hardware buffer overflow. Called after each successful
    /// read while no overflow is pending. `None` aborts with an error.
    ///
    /// Unlocked.
    fn check_overflow(&self, core: &RecorderCore) -> Option<OverflowCheck> {
        let _ = core;
        Some(OverflowCheck {
            overflowed: false,
            buffered_bursts: 0,
        })
    }

    /// Process the burst just read: submit per-channel data through
    /// [`ChannelDataSubmit`](crate::ChannelDataSubmit) and then publish the
    /// burst meta-information. Returning false aborts with an error.
    ///
    /// Unlocked.
    fn process_burst_data(&self, core: &RecorderCore) -> bool {
        let _ = core;
        false
    }

    /// Make any ongoing and future `read_burst` return promptly. Called at
    /// most once per arming, and only while the read loop is active.
    ///
    /// Locked; must not release the lock and MUST NOT block. Synchronous
    /// actions that could block belong on another thread. Must not call
    /// back into the controller.
    fn interrupt_reading(&self, port: &mut PortGuard<'_>) {
        let _ = port;
        // The disarm token is already signalled, which is what the default
        // read_burst is blocked on.
    }

    /// Stop acquisition; the reverse of `start_acquisition`. There is no
    /// error return, the controller could not react to one.
    ///
    /// Unlocked.
    fn stop_acquisition(&self, core: &RecorderCore);

    /// Called when the controller stops considering the digitizer armed.
    /// May be invoked more than once per arming on early-error paths.
    ///
    /// Locked; must not release the lock and must not block.
    fn on_disarmed(&self, port: &mut PortGuard<'_>) {
        let _ = port;
    }
}
