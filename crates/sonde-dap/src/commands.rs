//! Debug commands and when they apply.
//!
//! Every command checks [`DebugCommand::is_enabled`] against the manager's
//! current session and thread before it runs; a command that does not apply
//! is skipped rather than reported as an error.

use crate::manager::DebugSessionManager;
use crate::protocol::DisconnectArguments;
use crate::session::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugCommand {
    Stop,
    SuspendAllThreads,
    ResumeAllThreads,
    StepOver,
    StepInto,
    StepOut,
    SuspendThread,
    ResumeThread,
}

impl DebugCommand {
    pub const ALL: [DebugCommand; 8] = [
        DebugCommand::Stop,
        DebugCommand::SuspendAllThreads,
        DebugCommand::ResumeAllThreads,
        DebugCommand::StepOver,
        DebugCommand::StepInto,
        DebugCommand::StepOut,
        DebugCommand::SuspendThread,
        DebugCommand::ResumeThread,
    ];

    pub fn id(self) -> &'static str {
        match self {
            DebugCommand::Stop => "debug.stop",
            DebugCommand::SuspendAllThreads => "debug.thread.suspend.all",
            DebugCommand::ResumeAllThreads => "debug.thread.resume.all",
            DebugCommand::StepOver => "debug.thread.next",
            DebugCommand::StepInto => "debug.thread.stepin",
            DebugCommand::StepOut => "debug.thread.stepout",
            DebugCommand::SuspendThread => "debug.thread.suspend",
            DebugCommand::ResumeThread => "debug.thread.resume",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DebugCommand::Stop => "Stop",
            DebugCommand::SuspendAllThreads => "Suspend All",
            DebugCommand::ResumeAllThreads => "Resume All",
            DebugCommand::StepOver => "Step Over",
            DebugCommand::StepInto => "Step Into",
            DebugCommand::StepOut => "Step Out",
            DebugCommand::SuspendThread => "Suspend",
            DebugCommand::ResumeThread => "Resume",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|command| command.id() == id)
    }

    /// Whether the command applies to the manager's current state.
    pub fn is_enabled(self, manager: &DebugSessionManager) -> bool {
        let state = manager.state();
        match self {
            DebugCommand::Stop => state != SessionState::Inactive,
            DebugCommand::SuspendAllThreads => manager
                .current_session()
                .is_some_and(|s| !s.running_threads().is_empty()),
            DebugCommand::ResumeAllThreads => manager
                .current_session()
                .is_some_and(|s| !s.stopped_threads().is_empty()),
            DebugCommand::StepOver
            | DebugCommand::StepInto
            | DebugCommand::StepOut
            | DebugCommand::ResumeThread => state == SessionState::Stopped,
            DebugCommand::SuspendThread => state == SessionState::Running,
        }
    }

    /// Run the command if it is enabled. Returns whether it ran.
    ///
    /// Adapter failures are logged, not returned.
    pub async fn execute(self, manager: &DebugSessionManager) -> bool {
        if !self.is_enabled(manager) {
            tracing::debug!(command = self.id(), "command not available");
            return false;
        }
        let result = match self {
            DebugCommand::Stop => match manager.current_session() {
                Some(session) => session.disconnect(DisconnectArguments::default()).await,
                None => return false,
            },
            DebugCommand::SuspendAllThreads | DebugCommand::ResumeAllThreads => {
                let Some(session) = manager.current_session() else {
                    return false;
                };
                if self == DebugCommand::SuspendAllThreads {
                    session.pause_all().await;
                } else {
                    session.continue_all().await;
                }
                Ok(())
            }
            _ => {
                let Some(thread) = manager.current_thread() else {
                    return false;
                };
                match self {
                    DebugCommand::StepOver => thread.step_over().await,
                    DebugCommand::StepInto => thread.step_into().await,
                    DebugCommand::StepOut => thread.step_out().await,
                    DebugCommand::SuspendThread => thread.pause().await,
                    _ => thread.continue_execution().await.map(|_| ()),
                }
            }
        };
        if let Err(e) = result {
            tracing::warn!(command = self.id(), "{}: {e}", self.label());
        }
        true
    }
}

impl std::fmt::Display for DebugCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
