//! Summary states of a commandable component and the standard transitions
//! between them.
//!
//! ```text
//!   Offline ──enterControl──▶ Standby ──start──▶ Disabled ──enable──▶ Enabled
//!      ▲                       │  ▲               │  ▲                  │
//!      └──────exitControl──────┘  └────standby────┘  └─────disable──────┘
//!
//!   any state but Offline ──fault──▶ Fault ──standby / enterControl──▶ Standby
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Summary state, with the integer codes published on `summaryState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Disabled = 1,
    Enabled = 2,
    Fault = 3,
    Offline = 4,
    Standby = 5,
}

impl State {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Disabled),
            2 => Some(Self::Enabled),
            3 => Some(Self::Fault),
            4 => Some(Self::Offline),
            5 => Some(Self::Standby),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Disabled => "Disabled",
            State::Enabled => "Enabled",
            State::Fault => "Fault",
            State::Offline => "Offline",
            State::Standby => "Standby",
        };
        f.write_str(name)
    }
}

/// Standard state transition commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Start,
    Enable,
    Disable,
    Standby,
    EnterControl,
    ExitControl,
}

impl Transition {
    pub const ALL: [Transition; 6] = [
        Transition::Start,
        Transition::Enable,
        Transition::Disable,
        Transition::Standby,
        Transition::EnterControl,
        Transition::ExitControl,
    ];

    pub fn command_name(self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Enable => "enable",
            Transition::Disable => "disable",
            Transition::Standby => "standby",
            Transition::EnterControl => "enterControl",
            Transition::ExitControl => "exitControl",
        }
    }

    pub fn from_command_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.command_name() == name)
    }

    /// The only states the transition may start from.
    pub fn allowed_from(self) -> &'static [State] {
        match self {
            Transition::Start => &[State::Standby],
            Transition::Enable => &[State::Disabled],
            Transition::Disable => &[State::Enabled],
            Transition::Standby => &[State::Disabled, State::Fault],
            Transition::EnterControl => &[State::Offline, State::Fault],
            Transition::ExitControl => &[State::Standby],
        }
    }

    pub fn target(self) -> State {
        match self {
            Transition::Start => State::Disabled,
            Transition::Enable => State::Enabled,
            Transition::Disable => State::Disabled,
            Transition::Standby => State::Standby,
            Transition::EnterControl => State::Standby,
            Transition::ExitControl => State::Offline,
        }
    }

    pub fn is_allowed_from(self, state: State) -> bool {
        self.allowed_from().contains(&state)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        for code in 1..=5 {
            assert_eq!(State::from_i32(code).unwrap().as_i32(), code);
        }
        assert!(State::from_i32(0).is_none());
        assert!(State::from_i32(6).is_none());
    }

    #[test]
    fn test_transition_table() {
        assert!(Transition::Start.is_allowed_from(State::Standby));
        assert!(!Transition::Enable.is_allowed_from(State::Standby));
        assert!(Transition::Standby.is_allowed_from(State::Fault));
        assert!(!Transition::ExitControl.is_allowed_from(State::Disabled));
        assert_eq!(Transition::ExitControl.target(), State::Offline);

        // Nothing leaves Enabled except disable.
        let from_enabled: Vec<Transition> = Transition::ALL
            .into_iter()
            .filter(|t| t.is_allowed_from(State::Enabled))
            .collect();
        assert_eq!(from_enabled, vec![Transition::Disable]);
    }

    #[test]
    fn test_command_names() {
        for transition in Transition::ALL {
            assert_eq!(
                Transition::from_command_name(transition.command_name()),
                Some(transition)
            );
        }
        assert!(Transition::from_command_name("setLogLevel").is_none());
    }
}
