//! Host-automatable parameters and their live backing values.
//!
//! The table never owns a copy of any value: each entry shares an atomic
//! `ParamValue` with the DSP state that consumes it. Writes mark a per-entry
//! dirty bit so the outbound sync path can report each change to the host
//! exactly once per control tick.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// A parameter's authoritative store: f32 bits plus its dirty bit.
/// The value write is released before the dirty bit so a consumer that
/// observes the bit always reads the new value.
pub struct ParamValue {
    bits: AtomicU32,
    dirty: AtomicBool,
}

impl ParamValue {
    pub fn new(value: f32) -> Arc<Self> {
        Arc::new(Self {
            bits: AtomicU32::new(value.to_bits()),
            dirty: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }
}

/// A change applied at a sample offset within a processing block.
#[derive(Debug, Clone, Copy)]
pub struct ParamEvent {
    pub offset: u32,
    pub index: usize,
    pub value: f32,
}

pub struct Parameter {
    pub name: &'static str,
    pub group: &'static str,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    pub step: f32,
    pub stepped: bool,
    value: Arc<ParamValue>,
}

pub struct ParameterTable {
    params: Vec<Parameter>,
    // Coarse flag so an idle control tick is one atomic load.
    changed: AtomicBool,
}

impl ParameterTable {
    pub fn new() -> Self {
        Self {
            params: Vec::new(),
            changed: AtomicBool::new(false),
        }
    }

    /// Registration order defines the stable parameter index.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        name: &'static str,
        group: &'static str,
        min: f32,
        max: f32,
        default: f32,
        step: f32,
        backing: Arc<ParamValue>,
        stepped: bool,
    ) -> usize {
        backing.set(default);
        self.params.push(Parameter {
            name,
            group,
            min,
            max,
            default,
            step,
            stepped,
            value: backing,
        });
        self.params.len() - 1
    }

    pub fn count(&self) -> usize {
        self.params.len()
    }

    pub fn describe(&self, index: usize) -> Option<&Parameter> {
        self.params.get(index)
    }

    pub fn get(&self, index: usize) -> f32 {
        self.params.get(index).map_or(0.0, |p| p.value.get())
    }

    /// Write the backing value and mark the entry dirty. Single producer per
    /// index; concurrent readers are fine.
    pub fn set(&self, index: usize, value: f32) {
        let Some(param) = self.params.get(index) else {
            return;
        };
        param.value.set(value);
        param.value.dirty.store(true, Ordering::Release);
        self.changed.store(true, Ordering::Release);
    }

    /// Test-and-clear the dirty bit; true at most once per logical change.
    pub fn consume_dirty(&self, index: usize) -> bool {
        self.params
            .get(index)
            .map_or(false, |p| p.value.dirty.swap(false, Ordering::AcqRel))
    }

    /// True if any `set` happened since the last `sync_dirty` drain.
    pub fn any_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Outbound sync: one callback per dirty parameter, carrying the current
    /// value, then the coarse flag resets.
    pub fn sync_dirty(&self, mut notify: impl FnMut(usize, f32)) {
        if !self.changed.swap(false, Ordering::AcqRel) {
            return;
        }
        for index in 0..self.params.len() {
            if self.consume_dirty(index) {
                notify(index, self.get(index));
            }
        }
    }

    /// Two-decimal text for the host's display protocol.
    pub fn value_to_text(&self, value: f32) -> String {
        format!("{:.2}", value)
    }

    /// Parse host-entered text; the table stores floats as-is and leaves
    /// stepped rounding to the consumer.
    pub fn text_to_value(&self, text: &str) -> Option<f32> {
        text.trim().parse::<f32>().ok()
    }
}

impl Default for ParameterTable {
    fn default() -> Self {
        Self::new()
    }
}
