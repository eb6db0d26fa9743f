//! Coordinator state machine.

/// Global state of the execution coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    /// Constructed but not yet initialized.
    #[default]
    NotStarted,
    /// Idle, waiting for commands.
    Ready,
    /// A command is executing.
    Running,
    /// An abort was requested and the running command is unwinding.
    Aborting,
    /// Torn down; no further transitions are accepted.
    Disposed,
    /// The engine reported a state the coordinator cannot classify.
    Unknown,
}

impl CoordinatorState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - NotStarted -> Ready
    /// - Ready -> Running, Running -> Ready
    /// - Ready | Running -> Aborting, Aborting -> Ready
    /// - any live state <-> Unknown
    /// - any state except Disposed -> Disposed
    pub fn can_transition_to(&self, target: CoordinatorState) -> bool {
        use CoordinatorState::*;
        match (*self, target) {
            (Disposed, _) => false,
            (_, Disposed) => true,
            (NotStarted, Ready) => true,
            (Ready, Running) | (Running, Ready) => true,
            (Ready, Aborting) | (Running, Aborting) | (Aborting, Ready) => true,
            (Ready | Running | Aborting, Unknown) => true,
            (Unknown, Ready | Running | Aborting) => true,
            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    ///
    /// Returns `Ok(())` if the transition is valid, or an error otherwise.
    pub fn transition_to(&mut self, target: CoordinatorState) -> crate::Result<()> {
        if self.can_transition_to(target) {
            *self = target;
            Ok(())
        } else {
            Err(crate::error::CoordinatorError::InvalidStateTransition {
                from: *self,
                to: target,
            })
        }
    }

    /// Check if this is the absorbing state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Disposed)
    }

    /// Check if an abort request would be ignored.
    pub fn ignores_abort(&self) -> bool {
        matches!(self, CoordinatorState::Aborting | CoordinatorState::Disposed)
    }
}
