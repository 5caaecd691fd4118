//! Child Lifecycle State Machine
//!
//! The life of a child runs linearly forward through the spawn states;
//! `dead` may be entered from any running state on a terminal error, and
//! `cleaned_up` is reachable only from `stopped` or `dead` once the
//! sandbox has actually been deleted.

use regex::Regex;

use crate::types::{ChildStatus, ZERO_ADDRESS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildState {
    Init,
    SandboxCreated,
    RuntimeReady,
    WalletVerified,
    Funded,
    Starting,
    Healthy,
    Stopped,
    Dead,
    CleanedUp,
}

impl ChildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildState::Init => "init",
            ChildState::SandboxCreated => "sandbox_created",
            ChildState::RuntimeReady => "runtime_ready",
            ChildState::WalletVerified => "wallet_verified",
            ChildState::Funded => "funded",
            ChildState::Starting => "starting",
            ChildState::Healthy => "healthy",
            ChildState::Stopped => "stopped",
            ChildState::Dead => "dead",
            ChildState::CleanedUp => "cleaned_up",
        }
    }

    pub fn parse(s: &str) -> Option<ChildState> {
        match s {
            "init" => Some(ChildState::Init),
            "sandbox_created" => Some(ChildState::SandboxCreated),
            "runtime_ready" => Some(ChildState::RuntimeReady),
            "wallet_verified" => Some(ChildState::WalletVerified),
            "funded" => Some(ChildState::Funded),
            "starting" => Some(ChildState::Starting),
            "healthy" => Some(ChildState::Healthy),
            "stopped" => Some(ChildState::Stopped),
            "dead" => Some(ChildState::Dead),
            "cleaned_up" => Some(ChildState::CleanedUp),
            _ => None,
        }
    }

    /// The next state on the linear forward path, if any.
    pub fn successor(&self) -> Option<ChildState> {
        match self {
            ChildState::Init => Some(ChildState::SandboxCreated),
            ChildState::SandboxCreated => Some(ChildState::RuntimeReady),
            ChildState::RuntimeReady => Some(ChildState::WalletVerified),
            ChildState::WalletVerified => Some(ChildState::Funded),
            ChildState::Funded => Some(ChildState::Starting),
            ChildState::Starting => Some(ChildState::Healthy),
            ChildState::Healthy => Some(ChildState::Stopped),
            ChildState::Stopped => Some(ChildState::CleanedUp),
            ChildState::Dead | ChildState::CleanedUp => None,
        }
    }

    /// A state in which the child is (or is becoming) a live process.
    pub fn is_running(&self) -> bool {
        !matches!(
            self,
            ChildState::Stopped | ChildState::Dead | ChildState::CleanedUp
        )
    }

    /// The coarse status column value this lifecycle state maps to.
    pub fn status(&self) -> ChildStatus {
        match self {
            ChildState::Healthy => ChildStatus::Healthy,
            ChildState::Stopped => ChildStatus::Stopped,
            ChildState::Dead => ChildStatus::Dead,
            ChildState::CleanedUp => ChildStatus::CleanedUp,
            _ => ChildStatus::Spawning,
        }
    }
}

/// Whether a transition is allowed by the state machine.
pub fn can_transition(from: ChildState, to: ChildState) -> bool {
    if to == ChildState::Dead {
        return from.is_running();
    }
    if to == ChildState::CleanedUp {
        return matches!(from, ChildState::Stopped | ChildState::Dead);
    }
    from.successor() == Some(to)
}

/// A wallet address is `0x` followed by exactly forty hex digits and is
/// never the zero address.
pub fn is_valid_wallet_address(address: &str) -> bool {
    let re = Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("address pattern");
    re.is_match(address) && !address.eq_ignore_ascii_case(ZERO_ADDRESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_forward_path() {
        let mut state = ChildState::Init;
        let expected = [
            ChildState::SandboxCreated,
            ChildState::RuntimeReady,
            ChildState::WalletVerified,
            ChildState::Funded,
            ChildState::Starting,
            ChildState::Healthy,
            ChildState::Stopped,
            ChildState::CleanedUp,
        ];
        for next in expected {
            assert!(can_transition(state, next), "{state:?} -> {next:?}");
            state = next;
        }
    }

    #[test]
    fn test_no_skipping_forward() {
        assert!(!can_transition(ChildState::Init, ChildState::Funded));
        assert!(!can_transition(ChildState::SandboxCreated, ChildState::Healthy));
        assert!(!can_transition(ChildState::Healthy, ChildState::Init));
    }

    #[test]
    fn test_dead_reachable_from_running_states() {
        assert!(can_transition(ChildState::SandboxCreated, ChildState::Dead));
        assert!(can_transition(ChildState::Funded, ChildState::Dead));
        assert!(can_transition(ChildState::Healthy, ChildState::Dead));
        assert!(!can_transition(ChildState::CleanedUp, ChildState::Dead));
    }

    #[test]
    fn test_cleaned_up_only_from_stopped_or_dead() {
        assert!(can_transition(ChildState::Stopped, ChildState::CleanedUp));
        assert!(can_transition(ChildState::Dead, ChildState::CleanedUp));
        assert!(!can_transition(ChildState::Healthy, ChildState::CleanedUp));
        assert!(!can_transition(ChildState::Starting, ChildState::CleanedUp));
    }

    #[test]
    fn test_wallet_address_validation() {
        assert!(is_valid_wallet_address(
            "0xAbCdEf0123456789abcdef0123456789ABCDEF01"
        ));
        assert!(!is_valid_wallet_address(
            "0x0000000000000000000000000000000000000000"
        ));
        assert!(!is_valid_wallet_address("0x1234"));
        assert!(!is_valid_wallet_address(
            "abcdef0123456789abcdef0123456789abcdef0123"
        ));
        assert!(!is_valid_wallet_address(
            "0xzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"
        ));
    }

    #[test]
    fn test_state_round_trips_through_strings() {
        for state in [
            ChildState::Init,
            ChildState::SandboxCreated,
            ChildState::RuntimeReady,
            ChildState::WalletVerified,
            ChildState::Funded,
            ChildState::Starting,
            ChildState::Healthy,
            ChildState::Stopped,
            ChildState::Dead,
            ChildState::CleanedUp,
        ] {
            assert_eq!(ChildState::parse(state.as_str()), Some(state));
        }
    }
}
