//! Known terminals of a fleet.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::aggregate::TerminalPhase;
use crate::terminal::Terminal;

#[derive(Debug, Default)]
struct State {
    terminals: BTreeMap<String, Arc<Terminal>>,
    paused: bool,
}

/// Terminals by name, plus the fleet-wide pause request.
///
/// Terminals are never removed: a terminal that disappears keeps its entry
/// and gets a fresh channel when it comes back.
#[derive(Debug, Default)]
pub struct TerminalRegistry {
    state: Mutex<State>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `terminal`, pausing it if the fleet is paused.
    ///
    /// Returns `false` if a terminal of that name is already registered.
    pub fn insert(&self, terminal: Arc<Terminal>) -> bool {
        let mut state = self.state.lock();
        if state.terminals.contains_key(terminal.name()) {
            return false;
        }
        if state.paused {
            terminal.pause();
        }
        debug!(terminal = %terminal.name(), paused = state.paused, "Terminal registered");
        state
            .terminals
            .insert(terminal.name().to_string(), terminal);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<Terminal>> {
        self.state.lock().terminals.get(name).cloned()
    }

    /// All terminals, ordered by name.
    pub fn all(&self) -> Vec<Arc<Terminal>> {
        self.state.lock().terminals.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().terminals.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().terminals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().terminals.is_empty()
    }

    /// Pause or resume every terminal, including ones registered later.
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock();
        state.paused = paused;
        for terminal in state.terminals.values() {
            if paused {
                terminal.pause();
            } else {
                terminal.resume();
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Phase of every terminal and whether any of them holds a card.
    pub fn phases(&self) -> (Vec<TerminalPhase>, bool) {
        let terminals = self.all();
        let phases = terminals
            .iter()
            .map(|t| TerminalPhase::new(t.status().real(), t.status().is_locked()))
            .collect();
        let any_present = terminals.iter().any(|t| t.card_present().get());
        (phases, any_present)
    }
}
