use std::marker::PhantomData;

use crate::port::{ParamId, ParamKind, ParamPort};

/// Typed handle to a configuration parameter owned by a [`ParamRegistry`].
///
/// `V` is the desired/snapshot value type, `i32` or `f64`. Handles are
/// handed out at registration time and stay valid for the life of the
/// controller.
pub struct ParamHandle<V> {
    index: usize,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for ParamHandle<V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<V> Copy for ParamHandle<V> {}

/// Snapshot storage for the three supported (desired, effective) type
/// pairs. The effective type is wider than the desired type where NaN is
/// needed as the "invalid / unarmed" sentinel.
enum SnapshotSlot {
    IntInt { snapshot: i32, invalid: i32 },
    IntFloat { snapshot: i32, invalid: f64 },
    FloatFloat { snapshot: f64, invalid: f64 },
}

/// One configuration parameter: a desired value and an effective value on
/// the bus, plus a snapshot slot frozen at the start of arming.
pub struct ConfigParam {
    base_name: String,
    desired: ParamId,
    effective: ParamId,
    internal: bool,
    irrelevant: bool,
    slot: SnapshotSlot,
}

impl ConfigParam {
    /// Snapshot verb: snapshot <- desired, irrelevant <- false.
    fn capture(&mut self, port: &ParamPort) {
        match &mut self.slot {
            SnapshotSlot::IntInt { snapshot, .. } | SnapshotSlot::IntFloat { snapshot, .. } => {
                *snapshot = port.get_int(self.desired).unwrap_or(0);
            }
            SnapshotSlot::FloatFloat { snapshot, .. } => {
                *snapshot = port.get_float(self.desired).unwrap_or(f64::NAN);
            }
        }
        self.irrelevant = false;
    }

    /// Snapshot verb: effective <- snapshot, or the invalid value if the
    /// parameter was marked irrelevant for this configuration.
    fn push_effective_from_snapshot(&self, port: &mut ParamPort) {
        match self.slot {
            SnapshotSlot::IntInt { snapshot, invalid } => {
                port.set_int(self.effective, if self.irrelevant { invalid } else { snapshot });
            }
            SnapshotSlot::IntFloat { snapshot, invalid } => {
                let v = if self.irrelevant { invalid } else { snapshot as f64 };
                port.set_float(self.effective, v);
            }
            SnapshotSlot::FloatFloat { snapshot, invalid } => {
                let v = if self.irrelevant { invalid } else { snapshot };
                port.set_float(self.effective, v);
            }
        }
    }

    /// Snapshot verb: effective <- invalid.
    fn push_effective_invalid(&self, port: &mut ParamPort) {
        match self.slot {
            SnapshotSlot::IntInt { invalid, .. } => port.set_int(self.effective, invalid),
            SnapshotSlot::IntFloat { invalid, .. } | SnapshotSlot::FloatFloat { invalid, .. } => {
                port.set_float(self.effective, invalid)
            }
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for f64 {}
}

/// Scalar types usable as the desired value of a configuration parameter.
///
/// Implemented for `i32` and `f64` only; the methods are plumbing for the
/// registry accessors and not meant to be called directly.
pub trait ParamScalar: sealed::Sealed + Copy {
    #[doc(hidden)]
    fn read_desired(port: &ParamPort, id: ParamId) -> Self;
    #[doc(hidden)]
    fn write_desired(port: &mut ParamPort, id: ParamId, value: Self);
    #[doc(hidden)]
    fn read_snapshot(param: &ConfigParam) -> Self;
    #[doc(hidden)]
    fn write_snapshot(param: &mut ConfigParam, value: Self);
}

impl ParamScalar for i32 {
    fn read_desired(port: &ParamPort, id: ParamId) -> i32 {
        port.get_int(id).unwrap_or(0)
    }

    fn write_desired(port: &mut ParamPort, id: ParamId, value: i32) {
        port.set_int(id, value);
    }

    fn read_snapshot(param: &ConfigParam) -> i32 {
        match param.slot {
            SnapshotSlot::IntInt { snapshot, .. } | SnapshotSlot::IntFloat { snapshot, .. } => {
                snapshot
            }
            SnapshotSlot::FloatFloat { .. } => unreachable!("integer handle to float parameter"),
        }
    }

    fn write_snapshot(param: &mut ConfigParam, value: i32) {
        match &mut param.slot {
            SnapshotSlot::IntInt { snapshot, .. } | SnapshotSlot::IntFloat { snapshot, .. } => {
                *snapshot = value
            }
            SnapshotSlot::FloatFloat { .. } => unreachable!("integer handle to float parameter"),
        }
    }
}

impl ParamScalar for f64 {
    fn read_desired(port: &ParamPort, id: ParamId) -> f64 {
        port.get_float(id).unwrap_or(f64::NAN)
    }

    fn write_desired(port: &mut ParamPort, id: ParamId, value: f64) {
        port.set_float(id, value);
    }

    fn read_snapshot(param: &ConfigParam) -> f64 {
        match param.slot {
            SnapshotSlot::FloatFloat { snapshot, .. } => snapshot,
            _ => unreachable!("float handle to integer parameter"),
        }
    }

    fn write_snapshot(param: &mut ConfigParam, value: f64) {
        match &mut param.slot {
            SnapshotSlot::FloatFloat { snapshot, .. } => *snapshot = value,
            _ => unreachable!("float handle to integer parameter"),
        }
    }
}

/// Ordered collection of the configuration parameters of one controller.
///
/// Registration creates the `DESIRED_<base>` and `EFFECTIVE_<base>` bus
/// parameters, initialises the effective value to the invalid sentinel and
/// write-protects it (and the desired value too for internal parameters).
pub struct ParamRegistry {
    params: Vec<ConfigParam>,
    snapshots_valid: bool,
}

impl ParamRegistry {
    pub(crate) fn new() -> Self {
        ParamRegistry {
            params: Vec::new(),
            snapshots_valid: false,
        }
    }

    fn add(
        &mut self,
        port: &mut ParamPort,
        base_name: &str,
        slot: SnapshotSlot,
        internal: bool,
    ) -> usize {
        let desired_kind = match slot {
            SnapshotSlot::IntInt { .. } | SnapshotSlot::IntFloat { .. } => ParamKind::Int,
            SnapshotSlot::FloatFloat { .. } => ParamKind::Float,
        };
        let effective_kind = match slot {
            SnapshotSlot::IntInt { .. } => ParamKind::Int,
            _ => ParamKind::Float,
        };
        let desired = port.create_param(&format!("DESIRED_{}", base_name), desired_kind);
        let effective = port.create_param(&format!("EFFECTIVE_{}", base_name), effective_kind);

        let param = ConfigParam {
            base_name: base_name.to_string(),
            desired,
            effective,
            internal,
            irrelevant: true,
            slot,
        };
        // The effective value reads as invalid until the first arming.
        // The desired value is deliberately left undefined so external
        // records can supply their own initial value at bring-up.
        param.push_effective_invalid(port);
        port.add_protected(effective);
        if internal {
            port.add_protected(desired);
        }
        self.params.push(param);
        self.params.len() - 1
    }

    pub(crate) fn add_int(
        &mut self,
        port: &mut ParamPort,
        base_name: &str,
        invalid: i32,
        internal: bool,
    ) -> ParamHandle<i32> {
        let index = self.add(
            port,
            base_name,
            SnapshotSlot::IntInt { snapshot: 0, invalid },
            internal,
        );
        ParamHandle { index, _marker: PhantomData }
    }

    pub(crate) fn add_int_float(
        &mut self,
        port: &mut ParamPort,
        base_name: &str,
        invalid: f64,
        internal: bool,
    ) -> ParamHandle<i32> {
        let index = self.add(
            port,
            base_name,
            SnapshotSlot::IntFloat { snapshot: 0, invalid },
            internal,
        );
        ParamHandle { index, _marker: PhantomData }
    }

    pub(crate) fn add_float(
        &mut self,
        port: &mut ParamPort,
        base_name: &str,
        invalid: f64,
        internal: bool,
    ) -> ParamHandle<f64> {
        let index = self.add(
            port,
            base_name,
            SnapshotSlot::FloatFloat { snapshot: 0.0, invalid },
            internal,
        );
        ParamHandle { index, _marker: PhantomData }
    }

    pub(crate) fn desired_id<V>(&self, handle: ParamHandle<V>) -> ParamId {
        self.params[handle.index].desired
    }

    pub(crate) fn effective_id<V>(&self, handle: ParamHandle<V>) -> ParamId {
        self.params[handle.index].effective
    }

    pub(crate) fn desired<V: ParamScalar>(&self, port: &ParamPort, handle: ParamHandle<V>) -> V {
        V::read_desired(port, self.params[handle.index].desired)
    }

    /// Set the desired value of an internal parameter.
    pub(crate) fn set_desired<V: ParamScalar>(
        &self,
        port: &mut ParamPort,
        handle: ParamHandle<V>,
        value: V,
    ) {
        let param = &self.params[handle.index];
        debug_assert!(param.internal, "set_desired on a non-internal parameter");
        V::write_desired(port, param.desired, value);
    }

    /// Read the snapshot value. Only legal between the snapshot capture at
    /// the start of arming and the completion of disarm cleanup.
    pub(crate) fn snapshot<V: ParamScalar>(&self, handle: ParamHandle<V>) -> V {
        debug_assert!(self.snapshots_valid, "snapshot read outside the armed window");
        V::read_snapshot(&self.params[handle.index])
    }

    pub(crate) fn set_snapshot<V: ParamScalar>(&mut self, handle: ParamHandle<V>, value: V) {
        V::write_snapshot(&mut self.params[handle.index], value);
    }

    pub(crate) fn set_irrelevant<V>(&mut self, handle: ParamHandle<V>) {
        self.params[handle.index].irrelevant = true;
    }

    /// Freeze the desired values of every registered parameter.
    pub(crate) fn capture_all(&mut self, port: &ParamPort) {
        for param in &mut self.params {
            param.capture(port);
        }
        self.snapshots_valid = true;
    }

    /// Publish the captured snapshot of every parameter as its effective
    /// value (irrelevant parameters read as invalid).
    pub(crate) fn push_effective_all(&self, port: &mut ParamPort) {
        for param in &self.params {
            param.push_effective_from_snapshot(port);
        }
    }

    /// Reset every effective value to the invalid sentinel and close the
    /// snapshot window.
    pub(crate) fn invalidate_effective_all(&mut self, port: &mut ParamPort) {
        for param in &self.params {
            param.push_effective_invalid(port);
        }
        self.snapshots_valid = false;
    }
}
