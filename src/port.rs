use crossbeam_channel::{unbounded, Receiver, Sender};
use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one scalar parameter on the control bus.
///
/// Ids are dense indices assigned in creation order and are only meaningful
/// for the port that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamId(pub(crate) usize);

/// Value type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
    Int,
    Float,
    Text,
}

/// A parameter value as carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i32),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Text(_) => ParamKind::Text,
        }
    }
}

/// One parameter change, delivered to subscribers on a callback flush.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamUpdate {
    pub id: ParamId,
    pub name: String,
    pub value: ParamValue,
}

/// Error returned to the bus for a rejected external write.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WriteError {
    #[error("parameter is write-protected")]
    Protected,
    #[error("invalid arm request value {0}")]
    InvalidArmRequest(i32),
    #[error("no such parameter")]
    UnknownParam,
    #[error("value type does not match parameter type")]
    TypeMismatch,
}

struct ParamSlot {
    name: String,
    kind: ParamKind,
    value: Option<ParamValue>,
    dirty: bool,
}

/// Flat store of scalar parameters with change notification and a
/// write-protection list.
///
/// The port itself is not synchronized; it lives inside the controller's
/// port lock and all access goes through that lock.
pub struct ParamPort {
    slots: Vec<ParamSlot>,
    protected: Vec<ParamId>,
    subscribers: Vec<Sender<ParamUpdate>>,
}

impl ParamPort {
    pub(crate) fn new() -> Self {
        ParamPort {
            slots: Vec::new(),
            protected: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    /// Create a parameter. Duplicate names are a non-recoverable bring-up
    /// error, there is no caller that could meaningfully handle it.
    pub(crate) fn create_param(&mut self, name: &str, kind: ParamKind) -> ParamId {
        if self.lookup(name).is_some() {
            panic!("duplicate parameter name {:?}", name);
        }
        let id = ParamId(self.slots.len());
        self.slots.push(ParamSlot {
            name: name.to_string(),
            kind,
            value: None,
            dirty: false,
        });
        id
    }

    pub fn lookup(&self, name: &str) -> Option<ParamId> {
        self.slots
            .iter()
            .position(|s| s.name == name)
            .map(ParamId)
    }

    pub fn name(&self, id: ParamId) -> &str {
        &self.slots[id.0].name
    }

    pub fn kind(&self, id: ParamId) -> Option<ParamKind> {
        self.slots.get(id.0).map(|s| s.kind)
    }

    pub(crate) fn contains(&self, id: ParamId) -> bool {
        id.0 < self.slots.len()
    }

    fn set_value(&mut self, id: ParamId, value: ParamValue) {
        let slot = &mut self.slots[id.0];
        assert_eq!(slot.kind, value.kind(), "parameter type mismatch");
        // A write of the identical value does not produce a callback.
        // NaN compares unequal to itself, so NaN rewrites always notify.
        if slot.value.as_ref() != Some(&value) {
            slot.value = Some(value);
            slot.dirty = true;
        }
    }

    pub(crate) fn set_int(&mut self, id: ParamId, value: i32) {
        self.set_value(id, ParamValue::Int(value));
    }

    pub(crate) fn set_float(&mut self, id: ParamId, value: f64) {
        self.set_value(id, ParamValue::Float(value));
    }

    pub(crate) fn set_text(&mut self, id: ParamId, value: &str) {
        self.set_value(id, ParamValue::Text(value.to_string()));
    }

    pub fn get_int(&self, id: ParamId) -> Option<i32> {
        match self.slots.get(id.0).and_then(|s| s.value.as_ref()) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, id: ParamId) -> Option<f64> {
        match self.slots.get(id.0).and_then(|s| s.value.as_ref()) {
            Some(ParamValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_text(&self, id: ParamId) -> Option<&str> {
        match self.slots.get(id.0).and_then(|s| s.value.as_ref()) {
            Some(ParamValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub(crate) fn add_protected(&mut self, id: ParamId) {
        self.protected.push(id);
    }

    pub(crate) fn is_protected(&self, id: ParamId) -> bool {
        self.protected.contains(&id)
    }

    /// Check an external write against the protection list, logging on
    /// rejection.
    pub(crate) fn check_protected_write(&self, id: ParamId) -> Result<(), WriteError> {
        if self.is_protected(id) {
            error!(
                "rejected write to write-protected parameter {}",
                self.name(id)
            );
            Err(WriteError::Protected)
        } else {
            Ok(())
        }
    }

    pub(crate) fn subscribe(&mut self) -> Receiver<ParamUpdate> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver every pending change to all subscribers, in parameter
    /// creation order. Subscribers whose receiver is gone are dropped.
    pub(crate) fn flush_callbacks(&mut self) {
        for i in 0..self.slots.len() {
            if !self.slots[i].dirty {
                continue;
            }
            self.slots[i].dirty = false;
            let update = ParamUpdate {
                id: ParamId(i),
                name: self.slots[i].name.clone(),
                value: self.slots[i].value.clone().expect("dirty without value"),
            };
            self.subscribers
                .retain(|tx| tx.send(update.clone()).is_ok());
        }
    }
}
