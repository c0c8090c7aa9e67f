use crate::{
    error::EchoError,
    types::{BackendCommand, BackendEvent, LifecycleState},
};

const LIVE_STATES: [LifecycleState; 4] = [
    LifecycleState::Configured,
    LifecycleState::Authenticating,
    LifecycleState::Authenticated,
    LifecycleState::Streaming,
];

#[derive(Debug, Clone)]
pub struct LifecycleStateMachine {
    state: LifecycleState,
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self {
            state: LifecycleState::Cold,
        }
    }
}

impl LifecycleStateMachine {
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn apply(&mut self, command: &BackendCommand) -> Result<Vec<BackendEvent>, EchoError> {
        use BackendCommand::*;

        match command {
            Init { .. } => self.transition_from_any_of(
                &[LifecycleState::Cold],
                LifecycleState::Configured,
                "init",
            ),
            Login { .. } | Signup { .. } | RestoreSession => self.transition_from_any_of(
                &[LifecycleState::Configured, LifecycleState::LoggedOut],
                LifecycleState::Authenticating,
                "authenticate",
            ),
            StartRealtime => self.transition_from_any_of(
                &[LifecycleState::Authenticated],
                LifecycleState::Streaming,
                "start_realtime",
            ),
            StopRealtime => self.transition_from_any_of(
                &[LifecycleState::Streaming],
                LifecycleState::Authenticated,
                "stop_realtime",
            ),
            Logout => self.transition_from_any_of(&LIVE_STATES, LifecycleState::LoggedOut, "logout"),
            LoadTimeline
            | LoadMore
            | CreatePost { .. }
            | ToggleReaction { .. }
            | IncrementDisplayCount { .. }
            | FetchLatestReaction { .. } => {
                if self.is_authenticated_context() {
                    Ok(Vec::new())
                } else {
                    Err(EchoError::invalid_state(self.state, "feed command"))
                }
            }
        }
    }

    pub fn on_auth_result(&mut self, success: bool) -> Result<BackendEvent, EchoError> {
        if self.state != LifecycleState::Authenticating {
            return Err(EchoError::invalid_state(self.state, "on_auth_result"));
        }

        let next = if success {
            LifecycleState::Authenticated
        } else {
            LifecycleState::Configured
        };

        self.state = next;
        Ok(BackendEvent::StateChanged { state: next })
    }

    /// The session was cleared underneath an authenticated context.
    pub fn on_session_expired(&mut self) -> Result<BackendEvent, EchoError> {
        if !self.is_authenticated_context() {
            return Err(EchoError::invalid_state(self.state, "on_session_expired"));
        }

        self.state = LifecycleState::LoggedOut;
        Ok(BackendEvent::StateChanged {
            state: LifecycleState::LoggedOut,
        })
    }

    pub fn on_fatal(&mut self) -> BackendEvent {
        self.state = LifecycleState::Fatal;
        BackendEvent::StateChanged {
            state: LifecycleState::Fatal,
        }
    }

    pub fn is_authenticated_context(&self) -> bool {
        matches!(
            self.state,
            LifecycleState::Authenticated | LifecycleState::Streaming
        )
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[LifecycleState],
        next: LifecycleState,
        action: &str,
    ) -> Result<Vec<BackendEvent>, EchoError> {
        if !expected.contains(&self.state) {
            return Err(EchoError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![BackendEvent::StateChanged { state: next }])
    }
}
