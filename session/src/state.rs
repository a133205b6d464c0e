use serde::{Deserialize, Serialize};
use shared::GamerId;

/// Lifecycle of a session. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Lobby,
    Playing,
    Ended,
}

/// Something that moves a session from one state to another
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    StartGame,
    EndGame,
    End,
}

impl SessionState {
    /// State after `transition`, or `None` when it is not valid from here.
    pub fn apply(self, transition: Transition) -> Option<SessionState> {
        match (self, transition) {
            (SessionState::Ended, _) => None,
            (_, Transition::End) => Some(SessionState::Ended),
            (SessionState::Lobby, Transition::StartGame) => Some(SessionState::Playing),
            (SessionState::Playing, Transition::EndGame) => Some(SessionState::Lobby),
            _ => None,
        }
    }

    pub fn accepts_ready_changes(self) -> bool {
        self == SessionState::Lobby
    }

    pub fn is_joinable(self, allow_join_in_progress: bool) -> bool {
        match self {
            SessionState::Lobby => true,
            SessionState::Playing => allow_join_in_progress,
            SessionState::Ended => false,
        }
    }
}

/// Why a session ended, also used as the transport disconnect reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEndReason {
    ClientSignedOut,
    HostEndedSession,
    RemovedByHost,
    Disconnected,
}

impl SessionEndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionEndReason::ClientSignedOut => "ClientSignedOut",
            SessionEndReason::HostEndedSession => "HostEndedSession",
            SessionEndReason::RemovedByHost => "RemovedByHost",
            SessionEndReason::Disconnected => "Disconnected",
        }
    }

    /// Maps a transport disconnect reason back; anything unknown is a plain disconnect.
    pub fn from_reason(reason: &str) -> Self {
        match reason {
            "ClientSignedOut" => SessionEndReason::ClientSignedOut,
            "HostEndedSession" => SessionEndReason::HostEndedSession,
            "RemovedByHost" => SessionEndReason::RemovedByHost,
            _ => SessionEndReason::Disconnected,
        }
    }
}

/// Notifications queued by the session for the application to poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    GamerJoined {
        id: GamerId,
        gamertag: String,
        is_local: bool,
    },
    GamerLeft {
        id: GamerId,
        gamertag: String,
    },
    GameStarted,
    GameEnded,
    ReadyReset,
    /// The host had no slot left for one of our local profiles
    GamerIdDenied {
        gamertag: String,
    },
    SessionEnded {
        reason: SessionEndReason,
    },
}
