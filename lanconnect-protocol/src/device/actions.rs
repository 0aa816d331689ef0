//! Action gating
//!
//! An action is enabled iff the device is connected, paired, and the peer
//! supports every packet type the action needs.

use super::capabilities::NegotiatedCapabilities;
use crate::plugins::ActionSpec;
use std::collections::BTreeMap;

pub fn action_enabled(
    connected: bool,
    paired: bool,
    negotiated: &NegotiatedCapabilities,
    action: &ActionSpec,
) -> bool {
    connected && paired && negotiated.satisfies(action)
}

/// Registered action and its current enabled bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionState {
    pub plugin: &'static str,
    pub spec: &'static ActionSpec,
    pub enabled: bool,
}

impl ActionState {
    pub fn name(&self) -> &'static str {
        self.spec.name
    }
}

/// Actions of every plugin currently loaded on a device
#[derive(Debug, Default)]
pub(crate) struct ActionTable {
    actions: BTreeMap<&'static str, ActionState>,
}

impl ActionTable {
    /// Add a plugin's actions, initially disabled
    pub fn register(&mut self, plugin: &'static str, specs: &'static [ActionSpec]) {
        for spec in specs {
            self.actions.insert(
                spec.name,
                ActionState {
                    plugin,
                    spec,
                    enabled: false,
                },
            );
        }
    }

    /// Remove a plugin's actions, returning the names that were enabled
    pub fn unregister(&mut self, plugin: &str) -> Vec<&'static str> {
        let mut disabled = Vec::new();
        self.actions.retain(|name, state| {
            if state.plugin != plugin {
                return true;
            }
            if state.enabled {
                disabled.push(*name);
            }
            false
        });
        disabled
    }

    /// Recompute every enabled bit, returning the ones that flipped
    pub fn recompute(
        &mut self,
        connected: bool,
        paired: bool,
        negotiated: &NegotiatedCapabilities,
    ) -> Vec<(&'static str, bool)> {
        let mut changed = Vec::new();
        for (name, state) in self.actions.iter_mut() {
            let enabled = action_enabled(connected, paired, negotiated, state.spec);
            if enabled != state.enabled {
                state.enabled = enabled;
                changed.push((*name, enabled));
            }
        }
        changed
    }

    pub fn get(&self, name: &str) -> Option<&ActionState> {
        self.actions.get(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).is_some_and(|state| state.enabled)
    }

    pub fn states(&self) -> Vec<ActionState> {
        self.actions.values().copied().collect()
    }
}
