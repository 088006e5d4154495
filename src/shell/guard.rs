// Guard - holds navigation while a form has unsaved edits

pub const LEAVE_PROMPT: &str = "Leave page without saving changes?";

/// Answer to a navigation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavOutcome {
    Proceed,
    NeedsConfirmation(&'static str),
}

/// Armed while any open form is dirty. Navigation, exit and frame
/// closing all ask the guard first.
#[derive(Debug, Default)]
pub struct NavGuard {
    active: bool,
}

impl NavGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn check(&self) -> NavOutcome {
        if self.active {
            NavOutcome::NeedsConfirmation(LEAVE_PROMPT)
        } else {
            NavOutcome::Proceed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_guard_lets_navigation_through() {
        let guard = NavGuard::new();
        assert_eq!(guard.check(), NavOutcome::Proceed);
    }

    #[test]
    fn test_active_guard_asks_for_confirmation() {
        let mut guard = NavGuard::new();
        guard.activate();
        assert_eq!(guard.check(), NavOutcome::NeedsConfirmation(LEAVE_PROMPT));
        guard.deactivate();
        assert_eq!(guard.check(), NavOutcome::Proceed);
    }
}
