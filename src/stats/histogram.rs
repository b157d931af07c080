/*!
 * Histograms
 *
 * Named bin collections carved out of the registry's shared histogram
 * area. Definitions are registered before the first fork; afterwards every
 * process binds the inherited area and updates bins with plain atomic
 * bumps keyed by bin index.
 */

use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::core::errors::StatError;
use crate::core::types::StatResult;

/// Bin distribution of one histogram.
#[derive(Debug, Clone)]
pub enum BinLayout {
    Linear { min: f64, max: f64, bins: usize },
    Log { min: f64, max: f64, bins: usize },
    /// Inclusive upper bounds, ascending; a final overflow bin is implied.
    Custom(Vec<f64>),
    /// One labeled bin per variant; values are variant indexes.
    Enum(Vec<String>),
}

impl BinLayout {
    #[must_use]
    pub fn bins(&self) -> usize {
        match self {
            BinLayout::Linear { bins, .. } | BinLayout::Log { bins, .. } => (*bins).max(1),
            BinLayout::Custom(bounds) => bounds.len() + 1,
            BinLayout::Enum(labels) => labels.len().max(1),
        }
    }

    #[must_use]
    pub fn bin_for(&self, value: f64) -> usize {
        let last = self.bins() - 1;
        match self {
            BinLayout::Linear { min, max, bins } => {
                if value <= *min || *max <= *min {
                    0
                } else if value >= *max {
                    last
                } else {
                    (((value - min) / (max - min)) * (*bins as f64)) as usize
                }
            }
            BinLayout::Log { min, max, bins } => {
                let min = min.max(f64::MIN_POSITIVE);
                if value <= min || *max <= min {
                    0
                } else if value >= *max {
                    last
                } else {
                    let span = max.ln() - min.ln();
                    (((value.ln() - min.ln()) / span) * (*bins as f64)) as usize
                }
            }
            BinLayout::Custom(bounds) => bounds
                .iter()
                .position(|b| value <= *b)
                .unwrap_or(bounds.len()),
            BinLayout::Enum(_) => (value as usize).min(last),
        }
    }

    #[must_use]
    pub fn label(&self, bin: usize) -> String {
        match self {
            BinLayout::Enum(labels) => labels
                .get(bin)
                .cloned()
                .unwrap_or_else(|| format!("bin{}", bin)),
            BinLayout::Custom(bounds) => match bounds.get(bin) {
                Some(b) => format!("<={}", b),
                None => "overflow".to_string(),
            },
            _ => format!("bin{}", bin),
        }
    }
}

#[derive(Debug, Clone)]
struct Def {
    name: String,
    layout: BinLayout,
    /// First slot of this histogram inside the shared area.
    slot: usize,
}

/// Pre-fork histogram definitions; sized before the registry region is
/// created, frozen when it is.
pub struct HistogramRegistry {
    defs: Mutex<Vec<Def>>,
    slots: Mutex<usize>,
    frozen: AtomicBool,
}

impl Default for HistogramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HistogramRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            defs: Mutex::new(Vec::new()),
            slots: Mutex::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    pub fn register(&self, name: &str, layout: BinLayout) -> StatResult<usize> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(StatError::HistogramAreaFull(
                "registry frozen after fork".to_string(),
            ));
        }
        let mut defs = self.defs.lock();
        if let Some(id) = defs.iter().position(|d| d.name == name) {
            return Ok(id);
        }
        let mut slots = self.slots.lock();
        let def = Def {
            name: name.to_string(),
            layout,
            slot: *slots,
        };
        *slots += def.layout.bins();
        defs.push(def);
        Ok(defs.len() - 1)
    }

    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Bytes the shared area must provide.
    #[must_use]
    pub fn area_size(&self) -> usize {
        *self.slots.lock() * std::mem::size_of::<u64>()
    }

    /// Bind the (inherited) shared area. Definitions are copied out, so the
    /// bound view is independent of the registry lock.
    ///
    /// # Safety
    /// `base` must point at `space` writable, 8-byte-aligned bytes shared
    /// with the other server processes and outliving the view.
    pub unsafe fn bind(&self, base: NonNull<u8>, space: usize) -> StatResult<BoundHistograms> {
        let need = self.area_size();
        if space < need {
            return Err(StatError::BlockTooSmall { have: space, need });
        }
        Ok(BoundHistograms {
            defs: self.defs.lock().clone(),
            base,
        })
    }
}

/// Histogram area bound into one process.
pub struct BoundHistograms {
    defs: Vec<Def>,
    base: NonNull<u8>,
}

unsafe impl Send for BoundHistograms {}
unsafe impl Sync for BoundHistograms {}

impl BoundHistograms {
    fn bin_slot(&self, def: &Def, bin: usize) -> &AtomicU64 {
        unsafe {
            let p = self.base.as_ptr().cast::<AtomicU64>();
            &*p.add(def.slot + bin)
        }
    }

    pub fn bump(&self, id: usize, value: f64) {
        let Some(def) = self.defs.get(id) else {
            return;
        };
        let bin = def.layout.bin_for(value);
        self.bin_slot(def, bin).fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<usize> {
        self.defs.iter().position(|d| d.name == name)
    }

    /// `(label, count)` rows for one histogram.
    #[must_use]
    pub fn snapshot(&self, id: usize) -> Vec<(String, u64)> {
        let Some(def) = self.defs.get(id) else {
            return Vec::new();
        };
        (0..def.layout.bins())
            .map(|bin| {
                (
                    def.layout.label(bin),
                    self.bin_slot(def, bin).load(Ordering::Relaxed),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn linear_bins() {
        let l = BinLayout::Linear {
            min: 0.0,
            max: 100.0,
            bins: 10,
        };
        assert_eq!(l.bin_for(-5.0), 0);
        assert_eq!(l.bin_for(5.0), 0);
        assert_eq!(l.bin_for(55.0), 5);
        assert_eq!(l.bin_for(100.0), 9);
        assert_eq!(l.bin_for(1e9), 9);
    }

    #[test]
    fn custom_bounds_have_an_overflow_bin() {
        let l = BinLayout::Custom(vec![10.0, 100.0, 1000.0]);
        assert_eq!(l.bins(), 4);
        assert_eq!(l.bin_for(10.0), 0);
        assert_eq!(l.bin_for(11.0), 1);
        assert_eq!(l.bin_for(5000.0), 3);
        assert_eq!(l.label(3), "overflow");
    }

    #[test]
    fn enum_bins_use_labels() {
        let l = BinLayout::Enum(vec!["ok".into(), "err".into()]);
        assert_eq!(l.bin_for(1.0), 1);
        assert_eq!(l.bin_for(9.0), 1); // clamped
        assert_eq!(l.label(0), "ok");
    }

    #[test]
    fn registry_assigns_disjoint_slots_and_binds() {
        let reg = HistogramRegistry::new();
        let a = reg
            .register(
                "latency",
                BinLayout::Linear {
                    min: 0.0,
                    max: 10.0,
                    bins: 4,
                },
            )
            .unwrap();
        let b = reg
            .register("status", BinLayout::Enum(vec!["ok".into(), "err".into()]))
            .unwrap();
        assert_eq!(reg.area_size(), (4 + 2) * 8);
        reg.freeze();

        let mut backing = vec![0u64; 6];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        let bound = unsafe { reg.bind(base, 48) }.unwrap();
        bound.bump(a, 5.1);
        bound.bump(b, 1.0);
        bound.bump(b, 1.0);
        assert_eq!(bound.snapshot(a)[2].1, 1);
        assert_eq!(bound.snapshot(b), vec![("ok".into(), 0), ("err".into(), 2)]);
    }
}
