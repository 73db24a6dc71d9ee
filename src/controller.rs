use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};

use crate::adapter::{ArmInfo, BurstMeta, DigitizerAdapter};
use crate::channels::ChannelsPort;
use crate::config::CoreConfig;
use crate::param::{ParamHandle, ParamRegistry, ParamScalar};
use crate::port::{ParamId, ParamKind, ParamPort, ParamUpdate, WriteError};
use crate::time_axis::TimeAxisPort;

/// Arming state of the controller, also the value space of the ARM_REQUEST
/// and ARM_STATE parameters. Only `Disarm`, `PostTrigger` and
/// `PrePostTrigger` are accepted as requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Disarm = 0,
    PostTrigger = 1,
    PrePostTrigger = 2,
    Busy = 3,
    Error = 4,
}

impl ArmState {
    pub fn from_request(value: i32) -> Option<ArmState> {
        match value {
            0 => Some(ArmState::Disarm),
            1 => Some(ArmState::PostTrigger),
            2 => Some(ArmState::PrePostTrigger),
            _ => None,
        }
    }
}

/// Binary-semaphore event: `signal` stores one wakeup, `wait` consumes it.
struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    fn new() -> Self {
        Event {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.signaled.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }
}

/// Level-triggered cancellation token for the disarm protocol. Once
/// requested it stays set until `reset`, so any number of waiters can
/// observe it without consuming it.
struct CancelToken {
    requested: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    fn new() -> Self {
        CancelToken {
            requested: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn request(&self) {
        *self.requested.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn is_requested(&self) -> bool {
        *self.requested.lock().unwrap()
    }

    fn wait(&self) {
        let mut requested = self.requested.lock().unwrap();
        while !*requested {
            requested = self.cond.wait(requested).unwrap();
        }
    }

    fn reset(&self) {
        *self.requested.lock().unwrap() = false;
    }
}

/// Ids and handles of the framework-owned parameters.
struct BaseParams {
    arm_request: ParamId,
    arm_state: ParamId,
    effective_sample_rate: ParamId,
    burst_id: ParamId,
    burst_time_burst: ParamId,
    burst_time_read: ParamId,
    burst_time_process: ParamId,
    sleep_after_burst: ParamId,
    digitizer_name: ParamId,
    time_array_unit_inv: ParamId,
    num_bursts: ParamHandle<i32>,
    num_post_samples: ParamHandle<i32>,
    num_pre_post_samples: ParamHandle<i32>,
    requested_sample_rate: ParamHandle<f64>,
    achievable_sample_rate: ParamHandle<f64>,
    // Cached for write dispatch.
    requested_rate_desired: ParamId,
}

/// Everything guarded by the port lock.
struct Inner {
    port: ParamPort,
    registry: ParamRegistry,
    base: BaseParams,
    arm_state: ArmState,
    armed: bool,
    allowing_data: bool,
    in_read_loop: bool,
    requested_arm_state: ArmState,
    requested_rearm_state: ArmState,
    rate_for_display: f64,
    shutdown: bool,
}

impl Inner {
    fn set_arm_state(&mut self, state: ArmState) {
        self.arm_state = state;
        self.port.set_int(self.base.arm_state, state as i32);
        self.port.flush_callbacks();
    }

    /// Publish the captured configuration as the effective values.
    fn set_effective_params(&mut self) {
        let Inner {
            port,
            registry,
            base,
            rate_for_display,
            ..
        } = self;
        port.set_float(base.effective_sample_rate, *rate_for_display);
        registry.push_effective_all(port);
        port.flush_callbacks();
    }

    /// Reset every effective value to its invalid sentinel.
    fn clear_effective_params(&mut self) {
        let Inner {
            port,
            registry,
            base,
            ..
        } = self;
        port.set_float(base.effective_sample_rate, f64::NAN);
        registry.invalidate_effective_all(port);
        port.flush_callbacks();
    }
}

/// Which arming stage failed; drives logging in the cleanup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Preconditions,
    BasicSettings,
    Settings,
    StartAcquisition,
    ReadBurst,
    OverflowCheck,
    ProcessBurst,
}

enum Outcome {
    Clean,
    Failed(Stage),
}

/// Holder of the port lock, passed to mutex-held adapter callbacks and
/// obtainable by anyone through [`RecorderCore::lock`].
///
/// Besides parameter access it exposes the controller operations that
/// require the lock to be held.
pub struct PortGuard<'a> {
    core: &'a RecorderCore,
    inner: Option<MutexGuard<'a, Inner>>,
}

impl<'a> PortGuard<'a> {
    fn inner(&self) -> &Inner {
        self.inner.as_ref().expect("port lock released")
    }

    fn inner_mut(&mut self) -> &mut Inner {
        self.inner.as_mut().expect("port lock released")
    }

    /// Run `f` with the port lock temporarily released, re-taking it
    /// before returning. Only callbacks documented as allowed to release
    /// the lock may use this.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.inner = None;
        let result = f();
        self.inner = Some(self.core.inner.lock().unwrap());
        result
    }

    /// Current desired value of a configuration parameter.
    pub fn desired<V: ParamScalar>(&self, handle: ParamHandle<V>) -> V {
        let inner = self.inner();
        inner.registry.desired(&inner.port, handle)
    }

    /// Set the desired value of an internal configuration parameter.
    pub fn set_desired<V: ParamScalar>(&mut self, handle: ParamHandle<V>, value: V) {
        let inner = self.inner_mut();
        let Inner { port, registry, .. } = inner;
        registry.set_desired(port, handle, value);
        port.flush_callbacks();
    }

    /// Snapshot value of a configuration parameter. Legal from
    /// `check_settings` until disarm cleanup completes.
    pub fn snapshot<V: ParamScalar>(&self, handle: ParamHandle<V>) -> V {
        self.inner().registry.snapshot(handle)
    }

    /// Rewrite a captured snapshot value. Only legal inside
    /// `check_settings`.
    pub fn set_snapshot<V: ParamScalar>(&mut self, handle: ParamHandle<V>, value: V) {
        self.inner_mut().registry.set_snapshot(handle, value);
    }

    /// Mark a parameter as unused by the current configuration; its
    /// effective value will read as invalid while armed. Only legal inside
    /// `check_settings`.
    pub fn set_irrelevant<V>(&mut self, handle: ParamHandle<V>) {
        self.inner_mut().registry.set_irrelevant(handle);
    }

    /// Read a plain scalar parameter.
    pub fn param_int(&self, id: ParamId) -> Option<i32> {
        self.inner().port.get_int(id)
    }

    pub fn param_float(&self, id: ParamId) -> Option<f64> {
        self.inner().port.get_float(id)
    }

    pub fn param_text(&self, id: ParamId) -> Option<String> {
        self.inner().port.get_text(id).map(str::to_string)
    }

    /// Write a plain scalar parameter and flush callbacks.
    pub fn set_param_int(&mut self, id: ParamId, value: i32) {
        let inner = self.inner_mut();
        inner.port.set_int(id, value);
        inner.port.flush_callbacks();
    }

    pub fn set_param_float(&mut self, id: ParamId, value: f64) {
        let inner = self.inner_mut();
        inner.port.set_float(id, value);
        inner.port.flush_callbacks();
    }

    pub fn set_param_text(&mut self, id: ParamId, value: &str) {
        let inner = self.inner_mut();
        inner.port.set_text(id, value);
        inner.port.flush_callbacks();
    }

    /// Desired sample rate as last written from outside. Adapters may use
    /// special values (e.g. negative for an external clock).
    pub fn requested_sample_rate(&self) -> f64 {
        let inner = self.inner();
        inner.registry.desired(&inner.port, inner.base.requested_sample_rate)
    }

    /// Report the achievable sample rate for the current desired rate.
    pub fn set_achievable_sample_rate(&mut self, rate: f64) {
        let inner = self.inner_mut();
        let handle = inner.base.achievable_sample_rate;
        let Inner { port, registry, .. } = inner;
        registry.set_desired(port, handle, rate);
        port.flush_callbacks();
    }

    /// Snapshot of the number of bursts: positive, or 0 for unlimited.
    pub fn num_bursts_snapshot(&self) -> i32 {
        self.inner().registry.snapshot(self.inner().base.num_bursts)
    }

    /// Snapshot of the post-trigger sample count; always positive.
    pub fn num_post_samples_snapshot(&self) -> i32 {
        self.inner().registry.snapshot(self.inner().base.num_post_samples)
    }

    /// Snapshot of the total sample count in pre-post-trigger mode, or 0
    /// when pre-samples are unused for this arming.
    pub fn num_pre_post_samples_snapshot(&self) -> i32 {
        self.inner()
            .registry
            .snapshot(self.inner().base.num_pre_post_samples)
    }

    pub fn requested_sample_rate_snapshot(&self) -> f64 {
        self.inner()
            .registry
            .snapshot(self.inner().base.requested_sample_rate)
    }

    pub fn achievable_sample_rate_snapshot(&self) -> f64 {
        self.inner()
            .registry
            .snapshot(self.inner().base.achievable_sample_rate)
    }

    /// True from the start of `wait_for_preconditions` until
    /// `stop_acquisition` has returned (or until an error observed before
    /// acquisition was started).
    pub fn is_armed(&self) -> bool {
        self.inner().armed
    }

    /// Initiate disarming as if an external disarm request arrived. No-op
    /// while disarmed.
    ///
    /// This may synchronously invoke the adapter's `interrupt_reading`;
    /// adapter code must not re-enter the controller from there.
    pub fn request_disarm_from_driver(&mut self) {
        if self.inner().arm_state != ArmState::Disarm {
            let core = self.core;
            core.request_disarming(self, ArmState::Disarm);
        }
    }

    /// Set the digitizer name reported on the bus.
    pub fn set_digitizer_name(&mut self, name: &str) {
        let inner = self.inner_mut();
        inner.port.set_text(inner.base.digitizer_name, name);
        inner.port.flush_callbacks();
    }
}

/// Shared state of one recorder: the parameter surface, the arming state
/// machine, and the channels and time-axis collaborators. Obtained from
/// [`Recorder`] (which derefs to it) and passed to unlocked adapter
/// callbacks.
pub struct RecorderCore {
    inner: Mutex<Inner>,
    start_arming: Event,
    disarm: CancelToken,
    adapter: Arc<dyn DigitizerAdapter>,
    channels: ChannelsPort,
    time_axis: TimeAxisPort,
    supports_pre_samples: bool,
}

impl RecorderCore {
    /// Take the port lock.
    pub fn lock(&self) -> PortGuard<'_> {
        PortGuard {
            core: self,
            inner: Some(self.inner.lock().unwrap()),
        }
    }

    pub fn channels(&self) -> &ChannelsPort {
        &self.channels
    }

    pub fn time_axis(&self) -> &TimeAxisPort {
        &self.time_axis
    }

    /// Find a parameter by its bus name.
    pub fn lookup_param(&self, name: &str) -> Option<ParamId> {
        self.inner.lock().unwrap().port.lookup(name)
    }

    /// Receive a message for every parameter change published on the bus.
    pub fn subscribe_params(&self) -> Receiver<ParamUpdate> {
        self.inner.lock().unwrap().port.subscribe()
    }

    pub fn read_int(&self, id: ParamId) -> Option<i32> {
        self.inner.lock().unwrap().port.get_int(id)
    }

    pub fn read_float(&self, id: ParamId) -> Option<f64> {
        self.inner.lock().unwrap().port.get_float(id)
    }

    pub fn read_text(&self, id: ParamId) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .port
            .get_text(id)
            .map(str::to_string)
    }

    /// External write of an integer parameter.
    pub fn write_int(&self, id: ParamId, value: i32) -> Result<(), WriteError> {
        let mut guard = self.lock();
        if !guard.inner().port.contains(id) {
            return Err(WriteError::UnknownParam);
        }
        if id == guard.inner().base.arm_request {
            return self.handle_arm_request(&mut guard, value);
        }
        guard.inner().port.check_protected_write(id)?;
        if guard.inner().port.kind(id) != Some(ParamKind::Int) {
            return Err(WriteError::TypeMismatch);
        }
        let inner = guard.inner_mut();
        inner.port.set_int(id, value);
        inner.port.flush_callbacks();
        Ok(())
    }

    /// External write of a float parameter.
    pub fn write_float(&self, id: ParamId, value: f64) -> Result<(), WriteError> {
        let mut guard = self.lock();
        if !guard.inner().port.contains(id) {
            return Err(WriteError::UnknownParam);
        }
        if id == guard.inner().base.requested_rate_desired {
            {
                let inner = guard.inner_mut();
                inner.port.set_float(id, value);
                inner.port.flush_callbacks();
            }
            let adapter = Arc::clone(&self.adapter);
            adapter.requested_sample_rate_changed(&mut guard);
            return Ok(());
        }
        guard.inner().port.check_protected_write(id)?;
        if guard.inner().port.kind(id) != Some(ParamKind::Float) {
            return Err(WriteError::TypeMismatch);
        }
        let inner = guard.inner_mut();
        inner.port.set_float(id, value);
        inner.port.flush_callbacks();
        Ok(())
    }

    /// External write of a text parameter.
    pub fn write_text(&self, id: ParamId, value: &str) -> Result<(), WriteError> {
        let mut guard = self.lock();
        if !guard.inner().port.contains(id) {
            return Err(WriteError::UnknownParam);
        }
        guard.inner().port.check_protected_write(id)?;
        if guard.inner().port.kind(id) != Some(ParamKind::Text) {
            return Err(WriteError::TypeMismatch);
        }
        let inner = guard.inner_mut();
        inner.port.set_text(id, value);
        inner.port.flush_callbacks();
        Ok(())
    }

    /// Atomically publish the meta parameters of the last burst. Call with
    /// the port lock NOT held, after the burst's data has been submitted.
    pub fn publish_burst_meta(&self, meta: &BurstMeta) {
        let mut inner = self.inner.lock().unwrap();
        let Inner { port, base, .. } = &mut *inner;
        port.set_int(base.burst_id, meta.burst_id);
        port.set_float(base.burst_time_burst, meta.time_burst);
        port.set_float(base.burst_time_read, meta.time_read);
        port.set_float(base.burst_time_process, meta.time_process);
        port.flush_callbacks();
    }

    /// Sleep for the current SLEEP_AFTER_BURST value if positive. Call
    /// with the port lock NOT held. The built-in read loop calls this
    /// after each processed burst.
    pub fn maybe_sleep_for_testing(&self) {
        let sleep = {
            let inner = self.inner.lock().unwrap();
            inner
                .port
                .get_float(inner.base.sleep_after_burst)
                .unwrap_or(0.0)
        };
        if sleep > 0.0 {
            thread::sleep(Duration::from_secs_f64(sleep));
        }
    }

    /// Block until disarming is requested. Used by the default
    /// `read_burst` of adapters that bypass the built-in read loop.
    pub fn wait_until_disarming(&self) {
        self.disarm.wait();
    }

    /// Data gate for submissions: the display rate while data is being
    /// accepted, `None` once disarming has revoked it.
    pub(crate) fn data_gate(&self) -> Option<f64> {
        let inner = self.inner.lock().unwrap();
        if inner.allowing_data {
            Some(inner.rate_for_display)
        } else {
            None
        }
    }

    fn handle_arm_request(
        &self,
        guard: &mut PortGuard<'_>,
        value: i32,
    ) -> Result<(), WriteError> {
        let Some(request) = ArmState::from_request(value) else {
            warn!("invalid arm request {}", value);
            return Err(WriteError::InvalidArmRequest(value));
        };
        {
            let inner = guard.inner_mut();
            inner.port.set_int(inner.base.arm_request, value);
            inner.port.flush_callbacks();
        }
        if guard.inner().arm_state == ArmState::Disarm {
            // Disarmed: an arm request starts an arming, a disarm request
            // has nothing to do.
            if request != ArmState::Disarm {
                self.start_arming_locked(guard.inner_mut(), request);
            }
        } else {
            // Armed or arming: request disarming, remembering the request
            // as the pending re-arm target.
            self.request_disarming(guard, request);
        }
        Ok(())
    }

    fn start_arming_locked(&self, inner: &mut Inner, requested: ArmState) {
        debug_assert!(matches!(
            requested,
            ArmState::PostTrigger | ArmState::PrePostTrigger
        ));
        debug_assert_eq!(inner.arm_state, ArmState::Disarm);
        info!("arming requested: {:?}", requested);

        inner.set_arm_state(ArmState::Busy);
        inner.requested_arm_state = requested;
        inner.requested_rearm_state = ArmState::Disarm;
        inner.in_read_loop = false;
        self.disarm.reset();
        self.start_arming.signal();
    }

    fn request_disarming(&self, guard: &mut PortGuard<'_>, rearm: ArmState) {
        debug_assert!(guard.inner().arm_state != ArmState::Disarm);

        // The disarm protocol runs only on the first request of an arming;
        // later requests just update the pending re-arm target.
        if !self.disarm.is_requested() {
            self.disarm.request();
            let inner = guard.inner_mut();
            inner.allowing_data = false;
            inner.set_arm_state(ArmState::Busy);
            if inner.in_read_loop {
                let adapter = Arc::clone(&self.adapter);
                adapter.interrupt_reading(guard);
            }
        }
        guard.inner_mut().requested_rearm_state = rearm;
    }

    fn acquisition_thread(&self) {
        loop {
            self.start_arming.wait();
            if self.inner.lock().unwrap().shutdown {
                break;
            }
            let adapter = Arc::clone(&self.adapter);
            let mut need_stop = false;
            let outcome = self.run_arming(&adapter, &mut need_stop);
            self.finish_arming(&adapter, outcome, need_stop);
        }
        debug!("acquisition thread exiting");
    }

    /// Everything up to entering the acquire-and-read loop: preconditions,
    /// snapshot capture, validation, effective values, time axis. Returns
    /// the burst budget (negative for unlimited).
    fn prepare_arming(&self, adapter: &Arc<dyn DigitizerAdapter>) -> Result<i32, Stage> {
        let mut guard = self.lock();
        debug_assert_eq!(guard.inner().arm_state, ArmState::Busy);
        guard.inner_mut().armed = true;

        if !adapter.wait_for_preconditions(&mut guard) {
            return Err(Stage::Preconditions);
        }

        // Freeze the desired values; from here on the driver layer sees
        // only the snapshot.
        {
            let inner = guard.inner_mut();
            let Inner { port, registry, .. } = inner;
            registry.capture_all(port);
        }

        if !self.check_basic_settings(guard.inner_mut()) {
            return Err(Stage::BasicSettings);
        }

        let mut arm_info = ArmInfo::new();
        if !adapter.check_settings(&mut guard, &mut arm_info) {
            return Err(Stage::Settings);
        }
        if !arm_info.rate_for_display.is_finite() {
            error!("check_settings did not provide a finite display sample rate");
            return Err(Stage::Settings);
        }

        let inner = guard.inner_mut();
        inner.rate_for_display = arm_info.rate_for_display;
        inner.set_effective_params();
        self.setup_time_axis(inner, &arm_info);
        self.channels.reset_arrays();

        let mut remaining = inner.registry.snapshot(inner.base.num_bursts);
        if remaining == 0 {
            remaining = -1; // negative means unlimited
        }
        Ok(remaining)
    }

    fn run_arming(
        &self,
        adapter: &Arc<dyn DigitizerAdapter>,
        need_stop: &mut bool,
    ) -> Outcome {
        let mut remaining = match self.prepare_arming(adapter) {
            Ok(remaining) => remaining,
            Err(stage) => return Outcome::Failed(stage),
        };

        let mut overflow = false;

        // One iteration per acquisition start: the initial arming plus one
        // per overflow recovery restart.
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if self.disarm.is_requested() {
                    return Outcome::Clean;
                }
                // Accept data from just before start_acquisition so bursts
                // arriving during startup are not dropped.
                inner.allowing_data = true;
            }

            // A start attempt, successful or not, obliges a stop during
            // cleanup.
            *need_stop = true;
            if !adapter.start_acquisition(self, overflow) {
                return Outcome::Failed(Stage::StartAcquisition);
            }

            {
                let mut inner = self.inner.lock().unwrap();
                if self.disarm.is_requested() {
                    return Outcome::Clean;
                }
                if !overflow {
                    let requested = inner.requested_arm_state;
                    inner.set_arm_state(requested);
                }
                inner.in_read_loop = true;
            }

            // The per-start budget; clamped down on overflow so we only
            // drain what the hardware buffer actually holds.
            let mut current_remaining = remaining;
            overflow = false;

            while current_remaining != 0 {
                if !adapter.read_burst(self) {
                    return Outcome::Failed(Stage::ReadBurst);
                }

                // Re-check before processing so no data is pushed for a
                // burst read while disarming was already underway.
                if self.disarm.is_requested() {
                    return Outcome::Clean;
                }

                if !overflow {
                    let Some(check) = adapter.check_overflow(self) else {
                        return Outcome::Failed(Stage::OverflowCheck);
                    };
                    if check.overflowed {
                        if check.buffered_bursts <= 0 {
                            error!(
                                "overflow reported with buffered_bursts = {}, \
                                 which must count the burst just read",
                                check.buffered_bursts
                            );
                            return Outcome::Failed(Stage::OverflowCheck);
                        }
                        overflow = true;
                        warn!(
                            "buffer overflow, reading up to {} more bursts before restart",
                            check.buffered_bursts - 1
                        );
                        current_remaining = if current_remaining < 0 {
                            check.buffered_bursts
                        } else {
                            current_remaining.min(check.buffered_bursts)
                        };
                    }
                }

                if !adapter.process_burst_data(self) {
                    return Outcome::Failed(Stage::ProcessBurst);
                }

                if current_remaining > 0 {
                    current_remaining -= 1;
                }
                if remaining > 0 {
                    remaining -= 1;
                }

                self.maybe_sleep_for_testing();
            }

            if remaining == 0 {
                return Outcome::Clean;
            }

            // Only an overflow can leave the burst loop with bursts still
            // remaining.
            debug_assert!(overflow);
            warn!("restarting acquisition after buffer overflow");
            self.inner.lock().unwrap().in_read_loop = false;
        }
    }

    /// Shared cleanup for clean stops and errors: error latching, the
    /// final stop_acquisition, effective-value invalidation, and the
    /// pending re-arm hand-off.
    fn finish_arming(
        &self,
        adapter: &Arc<dyn DigitizerAdapter>,
        outcome: Outcome,
        need_stop: bool,
    ) {
        let mut guard = self.lock();
        guard.inner_mut().in_read_loop = false;

        match outcome {
            Outcome::Failed(stage) if !self.disarm.is_requested() => {
                // Latch the error state until a disarm request arrives.
                error!("arming failed during {:?}; waiting for a disarm request", stage);
                guard.inner_mut().set_arm_state(ArmState::Error);
                if !need_stop {
                    // The failure happened before any start_acquisition,
                    // so the digitizer is effectively already disarmed.
                    guard.inner_mut().armed = false;
                    adapter.on_disarmed(&mut guard);
                }
                guard.unlocked(|| self.disarm.wait());
            }
            Outcome::Failed(_) => {
                // Disarming was already requested; the state is Busy.
            }
            Outcome::Clean => {
                // A clean stop also passes through Busy, so that
                // stop_acquisition always completes before Disarm is
                // published.
                guard.inner_mut().set_arm_state(ArmState::Busy);
            }
        }

        guard.inner_mut().allowing_data = false;

        if need_stop {
            guard.unlocked(|| adapter.stop_acquisition(self));
        }

        guard.inner_mut().armed = false;
        adapter.on_disarmed(&mut guard);

        guard.inner_mut().clear_effective_params();
        self.disarm.reset();

        let rearm = guard.inner().requested_rearm_state;
        if rearm != ArmState::Disarm {
            // Hand off to a fresh arming without publishing the
            // intermediate Disarm state.
            guard.inner_mut().arm_state = ArmState::Disarm;
            self.start_arming_locked(guard.inner_mut(), rearm);
        } else {
            guard.inner_mut().set_arm_state(ArmState::Disarm);
        }
    }

    fn check_basic_settings(&self, inner: &mut Inner) -> bool {
        let num_bursts = inner.registry.snapshot(inner.base.num_bursts);
        if num_bursts < 0 {
            error!("NUM_BURSTS is negative");
            return false;
        }

        let num_post = inner.registry.snapshot(inner.base.num_post_samples);
        if num_post <= 0 {
            error!("NUM_POST_SAMPLES must be at least 1");
            return false;
        }

        if inner.requested_arm_state == ArmState::PrePostTrigger {
            if !self.supports_pre_samples {
                error!("pre-post-trigger requested but the digitizer does not support pre-samples");
                return false;
            }
            let prepost = inner.registry.snapshot(inner.base.num_pre_post_samples);
            if prepost <= num_post {
                error!("NUM_PRE_POST_SAMPLES must exceed NUM_POST_SAMPLES");
                return false;
            }
        } else {
            // Pre-samples are unused in this mode; the snapshot reads 0
            // for the driver layer.
            let handle = inner.base.num_pre_post_samples;
            inner.registry.set_irrelevant(handle);
            inner.registry.set_snapshot(handle, 0);
        }
        true
    }

    fn setup_time_axis(&self, inner: &mut Inner, arm_info: &ArmInfo) {
        let unit_inv = inner
            .port
            .get_float(inner.base.time_array_unit_inv)
            .unwrap_or(1.0);
        let step = unit_inv / inner.rate_for_display;

        let (num_pre, num_post) = match arm_info.custom_time_axis {
            Some(span) => (span.num_pre, span.num_post),
            None => {
                let post = inner.registry.snapshot(inner.base.num_post_samples);
                let prepost = inner.registry.snapshot(inner.base.num_pre_post_samples);
                ((prepost - post).max(0) as usize, post as usize)
            }
        };
        self.time_axis.set_params(step, num_pre, num_post);
    }
}

/// Builder for a [`Recorder`].
///
/// Creates the framework parameters up front so the integrator can
/// register the adapter's configuration parameters, construct the adapter
/// with the returned handles, and then [`build`](Self::build).
pub struct RecorderBuilder {
    config: CoreConfig,
    port: ParamPort,
    registry: ParamRegistry,
    base: BaseParams,
}

impl RecorderBuilder {
    pub fn new(config: CoreConfig) -> Self {
        let mut port = ParamPort::new();
        let mut registry = ParamRegistry::new();

        let arm_request = port.create_param("ARM_REQUEST", ParamKind::Int);
        let arm_state = port.create_param("ARM_STATE", ParamKind::Int);
        let effective_sample_rate = port.create_param("EFFECTIVE_SAMPLE_RATE", ParamKind::Float);
        let burst_id = port.create_param("BURST_ID", ParamKind::Int);
        let burst_time_burst = port.create_param("BURST_TIME_BURST", ParamKind::Float);
        let burst_time_read = port.create_param("BURST_TIME_READ", ParamKind::Float);
        let burst_time_process = port.create_param("BURST_TIME_PROCESS", ParamKind::Float);
        let sleep_after_burst = port.create_param("SLEEP_AFTER_BURST", ParamKind::Float);
        let digitizer_name = port.create_param("DIGITIZER_NAME", ParamKind::Text);
        let time_array_unit_inv = port.create_param("TIME_ARRAY_UNIT_INV", ParamKind::Float);

        for id in [
            arm_state,
            effective_sample_rate,
            burst_id,
            burst_time_burst,
            burst_time_read,
            burst_time_process,
            digitizer_name,
        ] {
            port.add_protected(id);
        }

        port.set_int(arm_request, ArmState::Disarm as i32);
        port.set_int(arm_state, ArmState::Disarm as i32);
        port.set_float(effective_sample_rate, f64::NAN);
        port.set_float(sleep_after_burst, config.sleep_after_burst);
        port.set_text(digitizer_name, &config.name);
        port.set_float(time_array_unit_inv, 1.0);

        let num_bursts = registry.add_int_float(&mut port, "NUM_BURSTS", f64::NAN, false);
        let num_post_samples =
            registry.add_int_float(&mut port, "NUM_POST_SAMPLES", f64::NAN, false);
        let num_pre_post_samples =
            registry.add_int_float(&mut port, "NUM_PRE_POST_SAMPLES", f64::NAN, false);
        let requested_sample_rate =
            registry.add_float(&mut port, "REQUESTED_SAMPLE_RATE", f64::NAN, false);
        let achievable_sample_rate =
            registry.add_float(&mut port, "ACHIEVABLE_SAMPLE_RATE", f64::NAN, true);
        let requested_rate_desired = registry.desired_id(requested_sample_rate);

        let base = BaseParams {
            arm_request,
            arm_state,
            effective_sample_rate,
            burst_id,
            burst_time_burst,
            burst_time_read,
            burst_time_process,
            sleep_after_burst,
            digitizer_name,
            time_array_unit_inv,
            num_bursts,
            num_post_samples,
            num_pre_post_samples,
            requested_sample_rate,
            achievable_sample_rate,
            requested_rate_desired,
        };

        RecorderBuilder {
            config,
            port,
            registry,
            base,
        }
    }

    /// Register a configuration parameter with integer desired and
    /// effective values.
    pub fn int_config_param(&mut self, base_name: &str, invalid: i32) -> ParamHandle<i32> {
        self.registry.add_int(&mut self.port, base_name, invalid, false)
    }

    /// Register a configuration parameter with an integer desired value
    /// and a float effective value (NaN as the invalid sentinel).
    pub fn int_real_config_param(&mut self, base_name: &str, invalid: f64) -> ParamHandle<i32> {
        self.registry
            .add_int_float(&mut self.port, base_name, invalid, false)
    }

    /// Register a configuration parameter with float desired and effective
    /// values.
    pub fn real_config_param(&mut self, base_name: &str, invalid: f64) -> ParamHandle<f64> {
        self.registry
            .add_float(&mut self.port, base_name, invalid, false)
    }

    /// Like [`int_config_param`](Self::int_config_param) but internal: the
    /// desired value is written by the adapter, not the bus.
    pub fn internal_int_config_param(&mut self, base_name: &str, invalid: i32) -> ParamHandle<i32> {
        self.registry.add_int(&mut self.port, base_name, invalid, true)
    }

    pub fn internal_int_real_config_param(
        &mut self,
        base_name: &str,
        invalid: f64,
    ) -> ParamHandle<i32> {
        self.registry
            .add_int_float(&mut self.port, base_name, invalid, true)
    }

    pub fn internal_real_config_param(&mut self, base_name: &str, invalid: f64) -> ParamHandle<f64> {
        self.registry
            .add_float(&mut self.port, base_name, invalid, true)
    }

    /// Register a plain scalar parameter with no snapshot behavior.
    pub fn scalar_param(&mut self, name: &str, kind: ParamKind) -> ParamId {
        self.port.create_param(name, kind)
    }

    /// Write-protect a plain parameter.
    pub fn protect_param(&mut self, id: ParamId) {
        self.port.add_protected(id);
    }

    /// Assemble the recorder and start its acquisition thread.
    pub fn build(self, adapter: Arc<dyn DigitizerAdapter>) -> Recorder {
        let RecorderBuilder {
            config,
            mut port,
            registry,
            base,
        } = self;

        // Discard bring-up dirt; subscribers only see changes from here on.
        port.flush_callbacks();

        let num_channels = adapter.num_channels();
        let supports_pre_samples = adapter.supports_pre_samples();

        let inner = Inner {
            port,
            registry,
            base,
            arm_state: ArmState::Disarm,
            armed: false,
            allowing_data: false,
            in_read_loop: false,
            requested_arm_state: ArmState::Disarm,
            requested_rearm_state: ArmState::Disarm,
            rate_for_display: 0.0,
            shutdown: false,
        };

        let core = Arc::new(RecorderCore {
            inner: Mutex::new(inner),
            start_arming: Event::new(),
            disarm: CancelToken::new(),
            adapter,
            channels: ChannelsPort::new(num_channels, config.keep_last_bursts),
            time_axis: TimeAxisPort::new(),
            supports_pre_samples,
        });

        let thread_core = Arc::clone(&core);
        let acq_thread = thread::Builder::new()
            .name(format!("{}-acq", config.name))
            .spawn(move || thread_core.acquisition_thread())
            .expect("failed to spawn acquisition thread");

        Recorder {
            core,
            acq_thread: Some(acq_thread),
        }
    }
}

/// Owner of one digitizer controller.
///
/// Derefs to [`RecorderCore`] for the parameter surface. Dropping the
/// recorder disarms if necessary, stops the acquisition thread and tears
/// down the collaborator ports.
pub struct Recorder {
    core: Arc<RecorderCore>,
    acq_thread: Option<JoinHandle<()>>,
}

impl Recorder {
    /// Shorthand for a builder round-trip without extra adapter
    /// parameters.
    pub fn new(config: CoreConfig, adapter: Arc<dyn DigitizerAdapter>) -> Recorder {
        RecorderBuilder::new(config).build(adapter)
    }

    /// Shared handle to the controller, e.g. for data-submitting threads.
    pub fn core(&self) -> Arc<RecorderCore> {
        Arc::clone(&self.core)
    }
}

impl Deref for Recorder {
    type Target = RecorderCore;

    fn deref(&self) -> &RecorderCore {
        &self.core
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let core: &RecorderCore = &self.core;
        {
            let mut guard = core.lock();
            guard.inner_mut().shutdown = true;
            if guard.inner().arm_state != ArmState::Disarm {
                core.request_disarming(&mut guard, ArmState::Disarm);
            }
        }
        core.start_arming.signal();
        if let Some(thread) = self.acq_thread.take() {
            let _ = thread.join();
        }
    }
}
