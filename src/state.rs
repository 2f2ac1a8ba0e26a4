use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a parameter state object. Ids are unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

impl StateId {
    fn next() -> Self {
        StateId(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// The current position of a chain together with its log density.
///
/// A state has exactly one owner at a time. It is not `Clone`: an exchange
/// between chains moves the state object from one chain to the other.
#[derive(Debug)]
pub struct ChainState {
    id: StateId,
    position: Box<[f64]>,
    logp: f64,
}

impl ChainState {
    pub fn new(position: Box<[f64]>, logp: f64) -> Self {
        Self {
            id: StateId::next(),
            position,
            logp,
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn position(&self) -> &[f64] {
        &self.position
    }

    /// The untempered log density of the position.
    pub fn logp(&self) -> f64 {
        self.logp
    }

    pub fn dim(&self) -> usize {
        self.position.len()
    }

    /// Overwrite the position with an accepted candidate.
    pub(crate) fn accept(&mut self, candidate: &[f64], logp: f64) {
        self.position.copy_from_slice(candidate);
        self.logp = logp;
    }

    pub fn into_position(self) -> Box<[f64]> {
        self.position
    }
}

/// Counters reported by an [`OwnershipLedger`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnershipStats {
    /// Number of successful claims of a state by a chain.
    pub claims: u64,
    /// Number of claims of a state that was already claimed by another chain.
    pub conflicts: u64,
}

/// Instrumentation that records which chain currently executes on which
/// state object.
///
/// Chains claim their state at the start of a chunk and release it at the
/// end. A claim of a state that is held by a different chain is counted as a
/// conflict.
#[derive(Debug, Default)]
pub struct OwnershipLedger {
    owners: Mutex<HashMap<StateId, usize>>,
    claims: AtomicU64,
    conflicts: AtomicU64,
}

impl OwnershipLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, state: StateId, chain: usize) {
        let mut owners = self.owners.lock().expect("Poisoned lock");
        match owners.insert(state, chain) {
            Some(previous) if previous != chain => {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    state = state.value(),
                    chain,
                    previous,
                    "state claimed by two chains"
                );
            }
            _ => {
                self.claims.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn release(&self, state: StateId, chain: usize) {
        let mut owners = self.owners.lock().expect("Poisoned lock");
        if owners.get(&state) == Some(&chain) {
            owners.remove(&state);
        }
    }

    pub fn stats(&self) -> OwnershipStats {
        OwnershipStats {
            claims: self.claims.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}
