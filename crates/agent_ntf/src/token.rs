//! Notification token state machine (§4.4):
//!
//! ```text
//!   (none) --register--> Registered --verify(code)--> Confirmed --check--> Active
//!                               ^                                      |
//!                               +-------------- replace(tknId) --------+
//!   Active --delete--> Expired
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NtfTokenState {
    None,
    Registered,
    Confirmed,
    Active,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NtfMode {
    Instant,
    Periodic,
}

#[derive(Debug, Clone, Copy)]
pub enum NtfTransition {
    Register,
    Verify,
    Check,
    Replace,
    Delete,
}

impl NtfTokenState {
    /// Returns the resulting state, or `None` if `transition` is not legal
    /// from `self` — the state machine is the sole authority on legality,
    /// the supervisor never special-cases a transition inline.
    pub fn apply(self, transition: NtfTransition) -> Option<Self> {
        use NtfTokenState::*;
        use NtfTransition::*;
        match (self, transition) {
            (None, Register) => Some(Registered),
            (Registered, Verify) => Some(Confirmed),
            (Confirmed, Check) => Some(Active),
            (Active, Replace) => Some(Registered),
            (Active, Delete) => Some(Expired),
            _ => Option::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NtfToken {
    pub id: String,
    pub device_token: String,
    pub ntf_server: String,
    pub tkn_id: Option<String>,
    pub state: NtfTokenState,
    pub mode: NtfMode,
}

impl NtfToken {
    pub fn new(id: impl Into<String>, device_token: impl Into<String>, ntf_server: impl Into<String>, mode: NtfMode) -> Self {
        Self {
            id: id.into(),
            device_token: device_token.into(),
            ntf_server: ntf_server.into(),
            tkn_id: None,
            state: NtfTokenState::None,
            mode,
        }
    }

    pub fn transition(&mut self, transition: NtfTransition) -> Result<(), crate::error::NtfError> {
        match self.state.apply(transition) {
            Some(next) => {
                self.state = next;
                Ok(())
            }
            none => Err(crate::error::NtfError::IllegalTransition {
                from: self.state,
                to: none.unwrap_or(self.state),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_register_to_active() {
        let mut token = NtfToken::new("t1", "dev-token", "ntf.example", NtfMode::Instant);
        token.transition(NtfTransition::Register).unwrap();
        assert_eq!(token.state, NtfTokenState::Registered);
        token.transition(NtfTransition::Verify).unwrap();
        assert_eq!(token.state, NtfTokenState::Confirmed);
        token.transition(NtfTransition::Check).unwrap();
        assert_eq!(token.state, NtfTokenState::Active);
    }

    #[test]
    fn replace_loops_back_to_registered() {
        let mut token = NtfToken::new("t1", "dev-token", "ntf.example", NtfMode::Instant);
        token.state = NtfTokenState::Active;
        token.transition(NtfTransition::Replace).unwrap();
        assert_eq!(token.state, NtfTokenState::Registered);
    }

    #[test]
    fn delete_only_legal_from_active() {
        let mut token = NtfToken::new("t1", "dev-token", "ntf.example", NtfMode::Instant);
        assert!(token.transition(NtfTransition::Delete).is_err());
        token.state = NtfTokenState::Active;
        assert!(token.transition(NtfTransition::Delete).is_ok());
        assert_eq!(token.state, NtfTokenState::Expired);
    }

    #[test]
    fn check_illegal_before_confirmed() {
        let mut token = NtfToken::new("t1", "dev-token", "ntf.example", NtfMode::Instant);
        assert!(token.transition(NtfTransition::Check).is_err());
    }
}
