//! Shared GSM state: written by the cellular service, read synchronously by any
//! collaborator holding a clone of the handle.

use derive_more::Display;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU8, AtomicU32, Ordering},
};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
pub enum Sim {
    #[default]
    None = 0,
    Sim1 = 1,
    Sim2 = 2,
    Failure = 3,
    Unknown = 4,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default, FromPrimitive)]
pub enum Tray {
    #[default]
    Out = 0,
    In = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalQuality {
    pub rssi: Option<u32>,
    pub ber: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Sim(Sim),
    Selected(Sim),
    Tray(Tray),
    Signal(SignalQuality),
    OwnNumber(Option<String>),
}

type Callback = Box<dyn Fn(&StoreChange) + Send + Sync>;

const UNKNOWN: u32 = u32::MAX;

struct Inner {
    sim: AtomicU8,
    selected: AtomicU8,
    tray: AtomicU8,
    rssi: AtomicU32,
    ber: AtomicU32,
    own_number: Mutex<Option<String>>,
    callbacks: Mutex<Vec<Callback>>,
}

/// Cloneable handle to the GSM state. Clones share the same state.
#[derive(Clone)]
pub struct GsmStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GsmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GsmStore")
            .field("sim", &self.sim())
            .field("selected", &self.selected())
            .field("tray", &self.tray())
            .field("signal", &self.signal())
            .finish_non_exhaustive()
    }
}

impl Default for GsmStore {
    fn default() -> Self {
        Self::new(Sim::Sim1)
    }
}

impl GsmStore {
    pub fn new(selected: Sim) -> Self {
        Self {
            inner: Arc::new(Inner {
                sim: AtomicU8::new(Sim::None as u8),
                selected: AtomicU8::new(selected as u8),
                tray: AtomicU8::new(Tray::Out as u8),
                rssi: AtomicU32::new(UNKNOWN),
                ber: AtomicU32::new(UNKNOWN),
                own_number: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a callback invoked on the setter's thread after every change.
    pub fn on_change(&self, callback: impl Fn(&StoreChange) + Send + Sync + 'static) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    fn notify(&self, change: StoreChange) {
        let callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(&change);
        }
    }

    pub fn sim(&self) -> Sim {
        Sim::from_u8(self.inner.sim.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_sim(&self, sim: Sim) {
        self.inner.sim.store(sim as u8, Ordering::Release);
        self.notify(StoreChange::Sim(sim));
    }

    pub fn selected(&self) -> Sim {
        Sim::from_u8(self.inner.selected.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_selected(&self, sim: Sim) {
        self.inner.selected.store(sim as u8, Ordering::Release);
        self.notify(StoreChange::Selected(sim));
    }

    /// The SIM is usable iff the reported SIM is the selected slot.
    pub fn is_sim_initialized(&self) -> bool {
        let sim = self.sim();
        matches!(sim, Sim::Sim1 | Sim::Sim2) && sim == self.selected()
    }

    pub fn tray(&self) -> Tray {
        Tray::from_u8(self.inner.tray.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_tray(&self, tray: Tray) {
        self.inner.tray.store(tray as u8, Ordering::Release);
        self.notify(StoreChange::Tray(tray));
    }

    pub fn signal(&self) -> SignalQuality {
        let known = |v: u32| (v != UNKNOWN).then_some(v);
        SignalQuality {
            rssi: known(self.inner.rssi.load(Ordering::Acquire)),
            ber: known(self.inner.ber.load(Ordering::Acquire)),
        }
    }

    pub fn set_signal(&self, signal: SignalQuality) {
        self.inner
            .rssi
            .store(signal.rssi.unwrap_or(UNKNOWN), Ordering::Release);
        self.inner
            .ber
            .store(signal.ber.unwrap_or(UNKNOWN), Ordering::Release);
        self.notify(StoreChange::Signal(signal));
    }

    pub fn own_number(&self) -> Option<String> {
        self.inner
            .own_number
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_own_number(&self, number: Option<String>) {
        *self
            .inner
            .own_number
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = number.clone();
        self.notify(StoreChange::OwnNumber(number));
    }
}
