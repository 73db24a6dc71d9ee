//! End-to-end tests of the arming state machine, driven through the
//! parameter surface with a scripted adapter standing in for hardware.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use crossbeam_channel::Receiver;
use transrec::{
    ArmInfo, BurstMeta, ChannelDataSubmit, CoreConfig, DigitizerAdapter, OverflowCheck,
    ParamUpdate, ParamValue, PortGuard, Recorder, RecorderCore, SampleType, WriteError,
};

const TIMEOUT: Duration = Duration::from_secs(10);

/// Gate that lets tests control when `read_burst` returns: either a burst
/// is "available" or reading was interrupted.
struct ReadGate {
    state: Mutex<(usize, bool)>, // (pending bursts, interrupted)
    cond: Condvar,
}

impl ReadGate {
    fn new() -> Self {
        ReadGate {
            state: Mutex::new((0, false)),
            cond: Condvar::new(),
        }
    }

    fn push_bursts(&self, n: usize) {
        self.state.lock().unwrap().0 += n;
        self.cond.notify_all();
    }

    fn interrupt(&self) {
        self.state.lock().unwrap().1 = true;
        self.cond.notify_all();
    }

    fn clear_interrupt(&self) {
        self.state.lock().unwrap().1 = false;
    }

    fn wait_burst(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.1 {
                return;
            }
            if state.0 > 0 {
                state.0 -= 1;
                return;
            }
            state = self.cond.wait(state).unwrap();
        }
    }
}

/// Gate that can make `stop_acquisition` block until the test releases it.
struct StopGate {
    held: Mutex<bool>,
    cond: Condvar,
}

impl StopGate {
    fn new() -> Self {
        StopGate {
            held: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn hold(&self) {
        *self.held.lock().unwrap() = true;
    }

    fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.cond.notify_all();
    }

    fn pass(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.cond.wait(held).unwrap();
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum FailMode {
    None,
    CheckSettings,
    NoRate,
}

struct MockAdapter {
    channels: usize,
    supports_pre: bool,
    blocking_reads: bool,
    /// Samples to submit on channel 0 per processed burst; 0 disables.
    submit_samples: usize,
    rate: f64,
    fail: FailMode,
    /// Report an overflow on this (1-based) read, with this buffer count.
    overflow_at_read: Option<(usize, i32)>,
    /// Request a driver-side disarm after this many processed bursts.
    driver_disarm_after: Option<usize>,
    start_count: AtomicUsize,
    overflow_starts: AtomicUsize,
    stop_count: AtomicUsize,
    read_count: AtomicUsize,
    process_count: AtomicUsize,
    interrupt_count: AtomicUsize,
    disarmed_count: AtomicUsize,
    gate: ReadGate,
    stop_gate: StopGate,
}

impl MockAdapter {
    fn new() -> Self {
        MockAdapter {
            channels: 2,
            supports_pre: false,
            blocking_reads: false,
            submit_samples: 0,
            rate: 1e6,
            fail: FailMode::None,
            overflow_at_read: None,
            driver_disarm_after: None,
            start_count: AtomicUsize::new(0),
            overflow_starts: AtomicUsize::new(0),
            stop_count: AtomicUsize::new(0),
            read_count: AtomicUsize::new(0),
            process_count: AtomicUsize::new(0),
            interrupt_count: AtomicUsize::new(0),
            disarmed_count: AtomicUsize::new(0),
            gate: ReadGate::new(),
            stop_gate: StopGate::new(),
        }
    }
}

impl DigitizerAdapter for MockAdapter {
    fn num_channels(&self) -> usize {
        self.channels
    }

    fn supports_pre_samples(&self) -> bool {
        self.supports_pre
    }

    fn check_settings(&self, port: &mut PortGuard<'_>, arm_info: &mut ArmInfo) -> bool {
        match self.fail {
            FailMode::CheckSettings => return false,
            FailMode::NoRate => return true, // "forgets" rate_for_display
            FailMode::None => {}
        }
        assert!(port.num_post_samples_snapshot() > 0);
        arm_info.rate_for_display = self.rate;
        true
    }

    fn start_acquisition(&self, _core: &RecorderCore, overflow_restart: bool) -> bool {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        if overflow_restart {
            self.overflow_starts.fetch_add(1, Ordering::SeqCst);
        }
        self.gate.clear_interrupt();
        true
    }

    fn read_burst(&self, _core: &RecorderCore) -> bool {
        self.read_count.fetch_add(1, Ordering::SeqCst);
        if self.blocking_reads {
            self.gate.wait_burst();
        }
        true
    }

    fn check_overflow(&self, _core: &RecorderCore) -> Option<OverflowCheck> {
        if let Some((at_read, buffered)) = self.overflow_at_read {
            if self.read_count.load(Ordering::SeqCst) == at_read {
                return Some(OverflowCheck {
                    overflowed: true,
                    buffered_bursts: buffered,
                });
            }
        }
        Some(OverflowCheck {
            overflowed: false,
            buffered_bursts: 0,
        })
    }

    fn process_burst_data(&self, core: &RecorderCore) -> bool {
        let burst_id = self.process_count.fetch_add(1, Ordering::SeqCst) as i32;
        if self.submit_samples > 0 {
            let mut submit = ChannelDataSubmit::new();
            submit.allocate(SampleType::U16, self.submit_samples);
            if let Some(samples) = submit.data().and_then(|b| b.as_u16_mut()) {
                samples.fill(42);
            }
            submit.submit(core, 0, burst_id, burst_id as f64, SystemTime::now(), None);
        }
        core.publish_burst_meta(&BurstMeta::new(burst_id));
        if let Some(limit) = self.driver_disarm_after {
            if burst_id as usize + 1 == limit {
                core.lock().request_disarm_from_driver();
            }
        }
        true
    }

    fn interrupt_reading(&self, _port: &mut PortGuard<'_>) {
        self.interrupt_count.fetch_add(1, Ordering::SeqCst);
        self.gate.interrupt();
    }

    fn stop_acquisition(&self, _core: &RecorderCore) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.stop_gate.pass();
    }

    fn on_disarmed(&self, _port: &mut PortGuard<'_>) {
        self.disarmed_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Minimal adapter that leaves the read-loop callbacks at their defaults,
/// i.e. does not use the built-in read loop.
struct PassiveAdapter {
    start_count: AtomicUsize,
    stop_count: AtomicUsize,
}

impl DigitizerAdapter for PassiveAdapter {
    fn num_channels(&self) -> usize {
        1
    }

    fn check_settings(&self, _port: &mut PortGuard<'_>, arm_info: &mut ArmInfo) -> bool {
        arm_info.rate_for_display = 1e3;
        true
    }

    fn start_acquisition(&self, _core: &RecorderCore, _overflow_restart: bool) -> bool {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn stop_acquisition(&self, _core: &RecorderCore) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    rec: Recorder,
    adapter: Arc<MockAdapter>,
    updates: Receiver<ParamUpdate>,
}

fn fixture(adapter: MockAdapter) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let adapter = Arc::new(adapter);
    let rec = Recorder::new(CoreConfig::new("tr-test"), adapter.clone());
    let updates = rec.subscribe_params();
    Fixture {
        rec,
        adapter,
        updates,
    }
}

fn id(rec: &Recorder, name: &str) -> transrec::ParamId {
    rec.lookup_param(name)
        .unwrap_or_else(|| panic!("no parameter {}", name))
}

/// Collect updates until ARM_STATE reaches `want` (inclusive).
fn drain_until_arm_state(rx: &Receiver<ParamUpdate>, want: i32) -> Vec<ParamUpdate> {
    let deadline = Instant::now() + TIMEOUT;
    let mut seen = Vec::new();
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for ARM_STATE == {}", want));
        let update = rx
            .recv_timeout(remaining)
            .unwrap_or_else(|_| panic!("timed out waiting for ARM_STATE == {}", want));
        let done = update.name == "ARM_STATE" && update.value == ParamValue::Int(want);
        seen.push(update);
        if done {
            return seen;
        }
    }
}

fn arm_states(updates: &[ParamUpdate]) -> Vec<i32> {
    updates
        .iter()
        .filter(|u| u.name == "ARM_STATE")
        .map(|u| match u.value {
            ParamValue::Int(v) => v,
            _ => panic!("ARM_STATE is not an int"),
        })
        .collect()
}

fn position_of(updates: &[ParamUpdate], name: &str, value: &ParamValue) -> Option<usize> {
    updates
        .iter()
        .position(|u| u.name == name && &u.value == value)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn happy_path_counts_bursts_and_publishes_effective_values() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.submit_samples = 16;
    let f = fixture(adapter);

    let desired_bursts = id(&f.rec, "DESIRED_NUM_BURSTS");
    let desired_post = id(&f.rec, "DESIRED_NUM_POST_SAMPLES");
    let effective_bursts = id(&f.rec, "EFFECTIVE_NUM_BURSTS");
    let arm_request = id(&f.rec, "ARM_REQUEST");

    assert!(f.rec.read_float(effective_bursts).unwrap().is_nan());

    let data_rx = f.rec.channels().subscribe();
    f.rec.write_int(desired_bursts, 3)?;
    f.rec.write_int(desired_post, 1000)?;
    f.rec.write_int(arm_request, 1)?;

    let updates = drain_until_arm_state(&f.updates, 0);
    assert_eq!(arm_states(&updates), vec![3, 1, 3, 0]);

    // Effective values are published before the armed state, and reset to
    // invalid before Disarm is published.
    let eff_set = position_of(&updates, "EFFECTIVE_NUM_BURSTS", &ParamValue::Float(3.0))
        .expect("effective NUM_BURSTS never published");
    let armed = position_of(&updates, "ARM_STATE", &ParamValue::Int(1)).unwrap();
    assert!(eff_set < armed);
    let eff_cleared = updates
        .iter()
        .rposition(|u| {
            u.name == "EFFECTIVE_NUM_BURSTS"
                && matches!(u.value, ParamValue::Float(v) if v.is_nan())
        })
        .expect("effective NUM_BURSTS never invalidated");
    let disarmed = position_of(&updates, "ARM_STATE", &ParamValue::Int(0)).unwrap();
    assert!(armed < eff_cleared && eff_cleared < disarmed);

    assert_eq!(f.adapter.read_count.load(Ordering::SeqCst), 3);
    assert_eq!(f.adapter.process_count.load(Ordering::SeqCst), 3);
    assert_eq!(f.adapter.start_count.load(Ordering::SeqCst), 1);
    assert_eq!(f.adapter.stop_count.load(Ordering::SeqCst), 1);

    // Three bursts on channel 0 carrying the display rate.
    for expected_id in 0..3 {
        let burst = data_rx.recv_timeout(TIMEOUT)?;
        assert_eq!(burst.channel, 0);
        assert_eq!(burst.unique_id, expected_id);
        assert_eq!(burst.sample_rate, 1e6);
        assert_eq!(burst.data.len(), 16);
    }
    assert!(data_rx.try_recv().is_err());

    // Post-trigger mode: the axis starts at the trigger.
    let axis = f.rec.time_axis().read_array(4);
    assert_eq!(axis.len(), 4);
    assert!(axis[0].abs() < 1e-15);
    assert!((axis[1] - 1e-6).abs() < 1e-12);

    assert!(f.rec.read_float(effective_bursts).unwrap().is_nan());
    assert!(!f.rec.lock().is_armed());
    Ok(())
}

#[test]
fn prepost_without_support_latches_error_until_disarm() -> Result<()> {
    let f = fixture(MockAdapter::new()); // supports_pre = false

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_BURSTS"), 1)?;
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 100)?;
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_PRE_POST_SAMPLES"), 200)?;
    let arm_request = id(&f.rec, "ARM_REQUEST");
    f.rec.write_int(arm_request, 2)?;

    let updates = drain_until_arm_state(&f.updates, 4);
    assert_eq!(arm_states(&updates), vec![3, 4]);

    // The error is sticky: nothing moves until a disarm request.
    std::thread::sleep(Duration::from_millis(50));
    assert!(f.updates.try_recv().is_err());

    f.rec.write_int(arm_request, 0)?;
    let updates = drain_until_arm_state(&f.updates, 0);
    assert_eq!(arm_states(&updates), vec![3, 0]);

    // Acquisition was never started, so it must not be stopped either.
    assert_eq!(f.adapter.start_count.load(Ordering::SeqCst), 0);
    assert_eq!(f.adapter.stop_count.load(Ordering::SeqCst), 0);
    assert!(f.adapter.disarmed_count.load(Ordering::SeqCst) >= 1);
    Ok(())
}

#[test]
fn disarm_during_blocked_read_interrupts_without_processing() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.blocking_reads = true;
    adapter.submit_samples = 8;
    let f = fixture(adapter);

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_BURSTS"), 2)?;
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 100)?;
    let arm_request = id(&f.rec, "ARM_REQUEST");
    let data_rx = f.rec.channels().subscribe();

    f.rec.write_int(arm_request, 1)?;
    drain_until_arm_state(&f.updates, 1);

    // Deliver one burst, then let the second read block.
    f.adapter.gate.push_bursts(1);
    let a = &f.adapter;
    wait_until("second read to start", || {
        a.read_count.load(Ordering::SeqCst) == 2
    });
    assert_eq!(a.process_count.load(Ordering::SeqCst), 1);

    f.rec.write_int(arm_request, 0)?;
    drain_until_arm_state(&f.updates, 0);

    assert_eq!(a.interrupt_count.load(Ordering::SeqCst), 1);
    assert_eq!(a.read_count.load(Ordering::SeqCst), 2);
    // The interrupted burst was never processed.
    assert_eq!(a.process_count.load(Ordering::SeqCst), 1);
    assert_eq!(a.stop_count.load(Ordering::SeqCst), 1);

    // Exactly one burst made it downstream.
    assert_eq!(data_rx.recv_timeout(TIMEOUT)?.unique_id, 0);
    assert!(data_rx.try_recv().is_err());
    Ok(())
}

#[test]
fn overflow_recovery_preserves_burst_count() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.overflow_at_read = Some((3, 2)); // one more burst in the FIFO
    let f = fixture(adapter);

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_BURSTS"), 10)?;
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 100)?;
    f.rec.write_int(id(&f.rec, "ARM_REQUEST"), 1)?;

    drain_until_arm_state(&f.updates, 0);

    let a = &f.adapter;
    // 4 bursts before the restart (overflow detected on the 3rd, one more
    // drained), 6 after; 10 in total.
    assert_eq!(a.process_count.load(Ordering::SeqCst), 10);
    assert_eq!(a.read_count.load(Ordering::SeqCst), 10);
    assert_eq!(a.start_count.load(Ordering::SeqCst), 2);
    assert_eq!(a.overflow_starts.load(Ordering::SeqCst), 1);
    assert_eq!(a.stop_count.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn rearm_while_armed_switches_mode_without_visible_disarm() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.supports_pre = true;
    adapter.blocking_reads = true;
    let f = fixture(adapter);

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_BURSTS"), 0)?; // unlimited
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 100)?;
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_PRE_POST_SAMPLES"), 200)?;
    let arm_request = id(&f.rec, "ARM_REQUEST");

    f.rec.write_int(arm_request, 1)?;
    drain_until_arm_state(&f.updates, 1);

    // Request the other mode while armed: disarm runs to completion, then
    // a fresh arming begins without Disarm ever being published.
    f.rec.write_int(arm_request, 2)?;
    let updates = drain_until_arm_state(&f.updates, 2);
    assert_eq!(arm_states(&updates), vec![3, 2]);

    let a = &f.adapter;
    assert_eq!(a.interrupt_count.load(Ordering::SeqCst), 1);
    assert_eq!(a.start_count.load(Ordering::SeqCst), 2);
    assert_eq!(a.stop_count.load(Ordering::SeqCst), 1);

    // Pre-post mode: 100 pre-trigger samples put the trigger mid-axis.
    let axis = f.rec.time_axis().read_array(200);
    assert_eq!(axis.len(), 200);
    assert!(axis[100].abs() < 1e-15);
    assert!(axis[0] < 0.0);

    f.rec.write_int(arm_request, 0)?;
    drain_until_arm_state(&f.updates, 0);
    Ok(())
}

#[test]
fn protected_and_invalid_writes_are_rejected() -> Result<()> {
    let f = fixture(MockAdapter::new());

    let arm_state = id(&f.rec, "ARM_STATE");
    let effective_bursts = id(&f.rec, "EFFECTIVE_NUM_BURSTS");
    let desired_achievable = id(&f.rec, "DESIRED_ACHIEVABLE_SAMPLE_RATE");
    let arm_request = id(&f.rec, "ARM_REQUEST");

    assert_eq!(
        f.rec.write_int(arm_state, 1),
        Err(WriteError::Protected)
    );
    assert_eq!(
        f.rec.write_float(effective_bursts, 5.0),
        Err(WriteError::Protected)
    );
    assert_eq!(
        f.rec.write_float(desired_achievable, 1e6),
        Err(WriteError::Protected)
    );
    assert_eq!(
        f.rec.write_int(arm_request, 7),
        Err(WriteError::InvalidArmRequest(7))
    );

    // Nothing changed and no transition happened.
    assert_eq!(f.rec.read_int(arm_state), Some(0));
    assert_eq!(f.rec.read_int(arm_request), Some(0));
    assert!(f.rec.read_float(effective_bursts).unwrap().is_nan());
    std::thread::sleep(Duration::from_millis(20));
    assert!(f.updates.try_recv().is_err());
    Ok(())
}

#[test]
fn disarm_while_disarmed_is_a_no_op() -> Result<()> {
    let f = fixture(MockAdapter::new());
    let arm_request = id(&f.rec, "ARM_REQUEST");
    for _ in 0..3 {
        f.rec.write_int(arm_request, 0)?;
    }
    std::thread::sleep(Duration::from_millis(20));
    assert!(f.updates.try_recv().is_err());
    assert_eq!(f.adapter.start_count.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn arm_requests_during_disarm_coalesce_to_the_last() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.supports_pre = true;
    adapter.blocking_reads = true;
    let f = fixture(adapter);

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_BURSTS"), 0)?;
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 100)?;
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_PRE_POST_SAMPLES"), 200)?;
    let arm_request = id(&f.rec, "ARM_REQUEST");

    f.rec.write_int(arm_request, 1)?;
    drain_until_arm_state(&f.updates, 1);

    // Park the cleanup inside stop_acquisition so the re-arm target can be
    // rewritten while disarming is still in progress.
    f.adapter.stop_gate.hold();
    f.rec.write_int(arm_request, 0)?;
    let a = &f.adapter;
    wait_until("cleanup to reach stop_acquisition", || {
        a.stop_count.load(Ordering::SeqCst) == 1
    });

    f.rec.write_int(arm_request, 2)?;
    f.rec.write_int(arm_request, 1)?; // last one wins
    f.adapter.stop_gate.release();

    let updates = drain_until_arm_state(&f.updates, 1);
    let states = arm_states(&updates);
    assert_eq!(*states.last().unwrap(), 1);
    assert!(!states.contains(&0), "Disarm must not be published: {:?}", states);
    assert!(!states.contains(&2), "intermediate request leaked: {:?}", states);
    assert_eq!(f.adapter.start_count.load(Ordering::SeqCst), 2);

    f.rec.write_int(arm_request, 0)?;
    drain_until_arm_state(&f.updates, 0);
    Ok(())
}

#[test]
fn snapshots_are_stable_under_desired_writes_while_armed() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.blocking_reads = true;
    let f = fixture(adapter);

    let desired_post = id(&f.rec, "DESIRED_NUM_POST_SAMPLES");
    let effective_post = id(&f.rec, "EFFECTIVE_NUM_POST_SAMPLES");
    let effective_prepost = id(&f.rec, "EFFECTIVE_NUM_PRE_POST_SAMPLES");
    let arm_request = id(&f.rec, "ARM_REQUEST");

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_BURSTS"), 0)?;
    f.rec.write_int(desired_post, 100)?;
    f.rec.write_int(arm_request, 1)?;
    drain_until_arm_state(&f.updates, 1);

    // A desired write while armed changes neither the snapshot nor the
    // effective value.
    f.rec.write_int(desired_post, 999)?;
    assert_eq!(f.rec.lock().num_post_samples_snapshot(), 100);
    assert_eq!(f.rec.read_float(effective_post), Some(100.0));
    // Pre-post samples are irrelevant in post-trigger mode.
    assert!(f.rec.read_float(effective_prepost).unwrap().is_nan());
    assert_eq!(f.rec.lock().num_pre_post_samples_snapshot(), 0);
    assert!(f.rec.lock().is_armed());

    f.rec.write_int(arm_request, 0)?;
    drain_until_arm_state(&f.updates, 0);
    assert!(f.rec.read_float(effective_post).unwrap().is_nan());

    // The next arming picks up the new desired value.
    f.rec.write_int(arm_request, 1)?;
    drain_until_arm_state(&f.updates, 1);
    assert_eq!(f.rec.read_float(effective_post), Some(999.0));
    f.rec.write_int(arm_request, 0)?;
    drain_until_arm_state(&f.updates, 0);
    Ok(())
}

#[test]
fn driver_requested_disarm_stops_cleanly() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.driver_disarm_after = Some(3);
    let f = fixture(adapter);

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_BURSTS"), 0)?; // unlimited
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 100)?;
    f.rec.write_int(id(&f.rec, "ARM_REQUEST"), 1)?;

    drain_until_arm_state(&f.updates, 0);

    let a = &f.adapter;
    assert_eq!(a.process_count.load(Ordering::SeqCst), 3);
    // The read after the disarm request returns but is not processed.
    assert_eq!(a.read_count.load(Ordering::SeqCst), 4);
    assert_eq!(a.interrupt_count.load(Ordering::SeqCst), 1);
    assert_eq!(a.stop_count.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn burst_meta_is_published_per_burst() -> Result<()> {
    let f = fixture(MockAdapter::new());

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_BURSTS"), 2)?;
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 100)?;
    f.rec.write_int(id(&f.rec, "ARM_REQUEST"), 1)?;
    let updates = drain_until_arm_state(&f.updates, 0);

    let ids: Vec<i32> = updates
        .iter()
        .filter(|u| u.name == "BURST_ID")
        .map(|u| match u.value {
            ParamValue::Int(v) => v,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(ids, vec![0, 1]);
    // Unreported timings read as NaN.
    let time_read = updates
        .iter()
        .find(|u| u.name == "BURST_TIME_READ")
        .expect("burst meta not flushed");
    assert!(matches!(time_read.value, ParamValue::Float(v) if v.is_nan()));
    Ok(())
}

#[test]
fn missing_display_rate_fails_the_arming() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.fail = FailMode::NoRate;
    let f = fixture(adapter);

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 100)?;
    let arm_request = id(&f.rec, "ARM_REQUEST");
    f.rec.write_int(arm_request, 1)?;
    let updates = drain_until_arm_state(&f.updates, 4);
    assert_eq!(arm_states(&updates), vec![3, 4]);

    f.rec.write_int(arm_request, 0)?;
    drain_until_arm_state(&f.updates, 0);
    assert_eq!(f.adapter.start_count.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn error_state_accepts_rearm_directly() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.fail = FailMode::CheckSettings;
    let f = fixture(adapter);

    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 100)?;
    let arm_request = id(&f.rec, "ARM_REQUEST");
    // Pre-post without support fails in basic validation.
    f.rec.write_int(arm_request, 2)?;
    drain_until_arm_state(&f.updates, 4);

    // Writing an arm request while in Error both disarms and re-arms; the
    // second attempt fails again and latches Error again.
    f.rec.write_int(arm_request, 1)?;
    let updates = drain_until_arm_state(&f.updates, 4);
    let states = arm_states(&updates);
    assert_eq!(*states.last().unwrap(), 4);
    assert!(!states.contains(&0));

    f.rec.write_int(arm_request, 0)?;
    drain_until_arm_state(&f.updates, 0);
    Ok(())
}

#[test]
fn requested_rate_echoes_to_achievable_by_default() -> Result<()> {
    let mut adapter = MockAdapter::new();
    adapter.blocking_reads = true; // park the read loop while we inspect
    let f = fixture(adapter);
    let requested = id(&f.rec, "DESIRED_REQUESTED_SAMPLE_RATE");
    let achievable = id(&f.rec, "DESIRED_ACHIEVABLE_SAMPLE_RATE");

    f.rec.write_float(requested, 5e5)?;
    assert_eq!(f.rec.read_float(achievable), Some(5e5));

    // Both rates land in the snapshot at the next arming.
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_BURSTS"), 0)?;
    f.rec.write_int(id(&f.rec, "DESIRED_NUM_POST_SAMPLES"), 10)?;
    let arm_request = id(&f.rec, "ARM_REQUEST");
    f.rec.write_int(arm_request, 1)?;
    drain_until_arm_state(&f.updates, 1);
    {
        let port = f.rec.lock();
        assert_eq!(port.requested_sample_rate_snapshot(), 5e5);
        assert_eq!(port.achievable_sample_rate_snapshot(), 5e5);
    }
    f.rec.write_int(arm_request, 0)?;
    drain_until_arm_state(&f.updates, 0);
    Ok(())
}

#[test]
fn passive_adapter_blocks_in_default_read_until_disarm() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let adapter = Arc::new(PassiveAdapter {
        start_count: AtomicUsize::new(0),
        stop_count: AtomicUsize::new(0),
    });
    let rec = Recorder::new(CoreConfig::new("tr-passive"), adapter.clone());
    let updates = rec.subscribe_params();

    rec.write_int(id(&rec, "DESIRED_NUM_BURSTS"), 0)?;
    rec.write_int(id(&rec, "DESIRED_NUM_POST_SAMPLES"), 10)?;
    let arm_request = id(&rec, "ARM_REQUEST");
    rec.write_int(arm_request, 1)?;
    drain_until_arm_state(&updates, 1);
    assert_eq!(adapter.start_count.load(Ordering::SeqCst), 1);

    // The default read_burst is parked on the disarm signal; a disarm
    // request releases it and the arming winds down cleanly.
    rec.write_int(arm_request, 0)?;
    drain_until_arm_state(&updates, 0);
    assert_eq!(adapter.stop_count.load(Ordering::SeqCst), 1);
    Ok(())
}
