//! Per-plugin lifecycle state machine

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// How a plugin is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mechanism {
    /// Shared library (or statically linked plugin) in the host's address space
    Native,
    /// Child process reached over the RPC channel
    Rpc,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Rpc => "rpc",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a plugin handle.
///
/// ```text
///   DISCOVERED ──load──▶ LOADED ──initialise──▶ INITIALIZED ──unload──▶ UNLOADED
///        │                 │                          │
///        └─error──▶ FAILED ◀┴──────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    Discovered = 0,
    Loaded = 1,
    Initialized = 2,
    Failed = 3,
    Unloaded = 4,
}

impl LifecycleState {
    /// Whether `self → next` is a legal transition
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Discovered, Loaded)
                | (Discovered, Failed)
                | (Loaded, Initialized)
                | (Loaded, Failed)
                | (Initialized, Failed)
                | (Loaded, Unloaded)
                | (Initialized, Unloaded)
                | (Failed, Unloaded)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Unloaded
    }

    /// Hooks may be called in these states
    pub fn is_live(self) -> bool {
        matches!(self, LifecycleState::Loaded | LifecycleState::Initialized)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Discovered,
            1 => Self::Loaded,
            2 => Self::Initialized,
            3 => Self::Failed,
            _ => Self::Unloaded,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Loaded => write!(f, "loaded"),
            Self::Initialized => write!(f, "initialized"),
            Self::Failed => write!(f, "failed"),
            Self::Unloaded => write!(f, "unloaded"),
        }
    }
}

/// Atomically updated lifecycle state.
///
/// Illegal transitions are refused rather than applied, so an unloaded handle
/// stays unloaded even if a late RPC crash report arrives.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: LifecycleState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if legal. Returns the state before the attempt.
    pub fn transition(&self, next: LifecycleState) -> Result<LifecycleState, LifecycleState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = LifecycleState::from_u8(current);
            if state == next {
                return Ok(state);
            }
            if !state.can_transition_to(next) {
                return Err(state);
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(state),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    const ALL: [LifecycleState; 5] = [Discovered, Loaded, Initialized, Failed, Unloaded];

    #[test]
    fn test_unloaded_is_terminal() {
        for next in ALL {
            assert!(!Unloaded.can_transition_to(next));
        }
        assert!(Unloaded.is_terminal());
    }

    #[test]
    fn test_initialized_requires_loaded() {
        assert!(!Discovered.can_transition_to(Initialized));
        assert!(Loaded.can_transition_to(Initialized));
    }

    #[test]
    fn test_unload_legal_from_loaded_initialized_failed() {
        assert!(Loaded.can_transition_to(Unloaded));
        assert!(Initialized.can_transition_to(Unloaded));
        assert!(Failed.can_transition_to(Unloaded));
        assert!(!Discovered.can_transition_to(Unloaded));
    }

    #[test]
    fn test_state_cell_refuses_illegal_moves() {
        let cell = StateCell::new(Discovered);
        assert_eq!(cell.transition(Loaded), Ok(Discovered));
        assert_eq!(cell.transition(Initialized), Ok(Loaded));
        assert_eq!(cell.transition(Unloaded), Ok(Initialized));
        assert_eq!(cell.transition(Failed), Err(Unloaded));
        assert_eq!(cell.get(), Unloaded);
    }

    #[test]
    fn test_display() {
        assert_eq!(Initialized.to_string(), "initialized");
        assert_eq!(Mechanism::Rpc.to_string(), "rpc");
    }
}
