use std::sync::Mutex;

struct TimeAxisInner {
    unit: f64,
    num_pre: usize,
    num_post: usize,
    update_count: u32,
}

/// Relative time axis for waveform displays.
///
/// The controller programs `(unit, num_pre, num_post)` during arming;
/// consumers regenerate the axis on demand with [`read_array`] and watch
/// [`update_count`] to learn that the parameters changed. Sample `i` maps
/// to `(i - num_pre) * unit`, so the trigger sits at time zero.
///
/// [`read_array`]: TimeAxisPort::read_array
/// [`update_count`]: TimeAxisPort::update_count
pub struct TimeAxisPort {
    inner: Mutex<TimeAxisInner>,
}

impl TimeAxisPort {
    pub(crate) fn new() -> Self {
        TimeAxisPort {
            inner: Mutex::new(TimeAxisInner {
                unit: 0.0,
                num_pre: 0,
                num_post: 0,
                update_count: 0,
            }),
        }
    }

    pub(crate) fn set_params(&self, unit: f64, num_pre: usize, num_post: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.unit = unit;
        inner.num_pre = num_pre;
        inner.num_post = num_post;
        inner.update_count = inner.update_count.wrapping_add(1);
    }

    /// Generate the time axis, truncated to at most `max_elements` values.
    pub fn read_array(&self, max_elements: usize) -> Vec<f64> {
        let inner = self.inner.lock().unwrap();
        let count = (inner.num_pre + inner.num_post).min(max_elements);
        (0..count)
            .map(|i| (i as f64 - inner.num_pre as f64) * inner.unit)
            .collect()
    }

    /// Bumped every time the axis parameters change.
    pub fn update_count(&self) -> u32 {
        self.inner.lock().unwrap().update_count
    }
}
