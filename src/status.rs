//! RGB status LED state.
//!
//! The LED driver is external; the appliance logs each transition and exposes
//! the current state through `/api/status`.

use parking_lot::Mutex;
use serde::Serialize;

use crate::store::ServiceEntry;

/// LED states, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedState {
    Booting,
    NoWifi,
    MeshcoreActive,
    AnyActiveDown,
    AnyPausedDown,
    AllUp,
}

/// How the LED shows a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedPattern {
    Steady,
    Pulse,
}

impl LedState {
    pub fn color(&self) -> &'static str {
        match self {
            LedState::Booting => "blue",
            LedState::NoWifi | LedState::AnyPausedDown => "amber",
            LedState::MeshcoreActive => "white",
            LedState::AnyActiveDown => "red",
            LedState::AllUp => "green",
        }
    }

    pub fn pattern(&self) -> LedPattern {
        match self {
            LedState::NoWifi | LedState::MeshcoreActive => LedPattern::Steady,
            _ => LedPattern::Pulse,
        }
    }

    /// Pick the highest-priority state that applies. A service counts as down
    /// once it has been checked and is not up; disabled services are ignored.
    pub fn evaluate(
        booting: bool,
        wifi_connected: bool,
        mesh_active: bool,
        services: &[ServiceEntry],
        now_ms: u64,
    ) -> LedState {
        if booting {
            return LedState::Booting;
        }
        if mesh_active {
            return LedState::MeshcoreActive;
        }
        if !wifi_connected {
            return LedState::NoWifi;
        }

        let down = services
            .iter()
            .filter(|e| e.service.enabled && e.runtime.last_check.is_some() && !e.runtime.is_up);
        let (mut active, mut paused) = (false, false);
        for entry in down {
            if entry.service.is_paused(now_ms) {
                paused = true;
            } else {
                active = true;
            }
        }

        if active {
            LedState::AnyActiveDown
        } else if paused {
            LedState::AnyPausedDown
        } else {
            LedState::AllUp
        }
    }
}

/// Tracks the current LED state and logs transitions.
pub struct StatusLed {
    state: Mutex<LedState>,
}

impl Default for StatusLed {
    fn default() -> Self {
        Self {
            state: Mutex::new(LedState::Booting),
        }
    }
}

impl StatusLed {
    pub fn get(&self) -> LedState {
        *self.state.lock()
    }

    /// Returns true when the state changed.
    pub fn set(&self, next: LedState) -> bool {
        let mut state = self.state.lock();
        if *state == next {
            return false;
        }
        tracing::info!(
            "LED: {:?} -> {:?} ({} {:?})",
            *state,
            next,
            next.color(),
            next.pattern()
        );
        *state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CodeOrName, ServiceInput};

    fn entry(is_up: bool, checked: bool) -> ServiceEntry {
        let service = ServiceInput {
            name: Some("svc".into()),
            kind: Some(CodeOrName::Code(1)),
            host: Some("10.0.0.1".into()),
            ..Default::default()
        }
        .into_service()
        .unwrap();
        let mut entry = ServiceEntry::new(service);
        entry.runtime.is_up = is_up;
        entry.runtime.last_check = checked.then_some(0);
        entry
    }

    #[test]
    fn test_priority_order() {
        let services = vec![entry(false, true)];
        assert_eq!(LedState::evaluate(true, false, true, &services, 0), LedState::Booting);
        assert_eq!(LedState::evaluate(false, false, true, &services, 0), LedState::MeshcoreActive);
        assert_eq!(LedState::evaluate(false, false, false, &services, 0), LedState::NoWifi);
        assert_eq!(LedState::evaluate(false, true, false, &services, 0), LedState::AnyActiveDown);
    }

    #[test]
    fn test_paused_and_unchecked_services() {
        let mut paused = entry(false, true);
        paused.service.set_pause(3600, 0);
        assert_eq!(
            LedState::evaluate(false, true, false, &[paused.clone()], 1_000),
            LedState::AnyPausedDown
        );

        // An active down outranks a paused one.
        let both = vec![paused, entry(false, true)];
        assert_eq!(LedState::evaluate(false, true, false, &both, 1_000), LedState::AnyActiveDown);

        let fresh = vec![entry(false, false), entry(true, true)];
        assert_eq!(LedState::evaluate(false, true, false, &fresh, 0), LedState::AllUp);
    }

    #[test]
    fn test_transitions_are_reported_once() {
        let led = StatusLed::default();
        assert_eq!(led.get(), LedState::Booting);
        assert!(led.set(LedState::AllUp));
        assert!(!led.set(LedState::AllUp));
        assert_eq!(LedState::AllUp.color(), "green");
        assert_eq!(LedState::NoWifi.pattern(), LedPattern::Steady);
    }
}
