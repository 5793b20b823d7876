use thiserror::Error;
use validator::ValidationErrors;

use crate::{
    dao::storage::StorageError,
    services::{identity::IdentityError, sandbox::SandboxError},
    state::execution::{CancelError, CompleteError, RequestError, VoteError},
};

/// Errors produced by room operations and the collaborators they call.
///
/// Every variant has a stable wire code (see [`ServiceError::code`]) that is sent back to the
/// originating connection inside a rejected acknowledgement.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend is unavailable.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Application is running in degraded mode without storage.
    #[error("storage unavailable (degraded mode)")]
    Degraded,
    /// Identity token missing, invalid or expired.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// Identity service could not be reached.
    #[error("identity service unavailable: {0}")]
    IdentityUnavailable(String),
    /// Room does not exist or has been ended.
    #[error("room `{0}` not found")]
    RoomNotFound(String),
    /// Caller is not an authorized member of the room.
    #[error("you are not a member of this room")]
    NotAMember,
    /// Caller has not joined the room on this connection.
    #[error("you have not joined this room")]
    NotActive,
    /// Vote from a participant that is not a required voter.
    #[error("you are not a voter for this execution request")]
    NotAVoter,
    /// Second decision from the same voter.
    #[error("you have already voted on this execution request")]
    AlreadyVoted,
    /// Vote or cancellation without a matching request.
    #[error("no execution request is pending")]
    NoPendingRequest,
    /// An execution request is already in progress for the room.
    #[error("an execution request is already pending")]
    RequestAlreadyPending,
    /// Execution attempted without the room's consent.
    #[error("execution has not been approved")]
    ExecutionNotApproved,
    /// Only the room owner may end the room.
    #[error("only the room owner can end the room")]
    NotOwner,
    /// Only the requester may cancel or complete an execution request.
    #[error("only the requester can do this")]
    NotRequester,
    /// Invalid input provided by the client.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Sandbox could not run the program.
    #[error("execution sandbox unavailable: {0}")]
    SandboxUnavailable(String),
    /// Sandbox did not answer in time.
    #[error("execution sandbox timed out")]
    SandboxTimeout,
}

impl ServiceError {
    /// Stable identifier sent on the wire alongside the human readable message.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Unavailable(_) => "storage-unavailable",
            ServiceError::Degraded => "degraded",
            ServiceError::Unauthenticated(_) => "unauthenticated",
            ServiceError::IdentityUnavailable(_) => "identity-unavailable",
            ServiceError::RoomNotFound(_) => "room-not-found",
            ServiceError::NotAMember => "not-a-member",
            ServiceError::NotActive => "not-active",
            ServiceError::NotAVoter => "not-a-voter",
            ServiceError::AlreadyVoted => "already-voted",
            ServiceError::NoPendingRequest => "no-pending-request",
            ServiceError::RequestAlreadyPending => "request-already-pending",
            ServiceError::ExecutionNotApproved => "execution-not-approved",
            ServiceError::NotOwner => "not-owner",
            ServiceError::NotRequester => "not-requester",
            ServiceError::InvalidInput(_) => "invalid-input",
            ServiceError::SandboxUnavailable(_) => "sandbox-unavailable",
            ServiceError::SandboxTimeout => "sandbox-timeout",
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        ServiceError::Unavailable(err)
    }
}

impl From<ValidationErrors> for ServiceError {
    fn from(err: ValidationErrors) -> Self {
        ServiceError::InvalidInput(format!("validation failed: {}", err))
    }
}

impl From<IdentityError> for ServiceError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Rejected(reason) => ServiceError::Unauthenticated(reason),
            IdentityError::Unavailable(reason) => ServiceError::IdentityUnavailable(reason),
        }
    }
}

impl From<SandboxError> for ServiceError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::UnsupportedLanguage(language) => {
                ServiceError::InvalidInput(format!("unsupported language `{language}`"))
            }
            SandboxError::Timeout => ServiceError::SandboxTimeout,
            other => ServiceError::SandboxUnavailable(other.to_string()),
        }
    }
}

impl From<RequestError> for ServiceError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::AlreadyPending => ServiceError::RequestAlreadyPending,
        }
    }
}

impl From<VoteError> for ServiceError {
    fn from(err: VoteError) -> Self {
        match err {
            VoteError::NoPending => ServiceError::NoPendingRequest,
            VoteError::NotAVoter => ServiceError::NotAVoter,
            VoteError::AlreadyVoted => ServiceError::AlreadyVoted,
        }
    }
}

impl From<CancelError> for ServiceError {
    fn from(err: CancelError) -> Self {
        match err {
            CancelError::NoPending => ServiceError::NoPendingRequest,
            CancelError::NotRequester => ServiceError::NotRequester,
        }
    }
}

impl From<CompleteError> for ServiceError {
    fn from(err: CompleteError) -> Self {
        match err {
            CompleteError::NotApproved => ServiceError::ExecutionNotApproved,
            CompleteError::NotRequester => ServiceError::NotRequester,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_errors_map_to_wire_codes() {
        assert_eq!(ServiceError::from(VoteError::NotAVoter).code(), "not-a-voter");
        assert_eq!(
            ServiceError::from(VoteError::AlreadyVoted).code(),
            "already-voted"
        );
        assert_eq!(
            ServiceError::from(VoteError::NoPending).code(),
            "no-pending-request"
        );
    }

    #[test]
    fn sandbox_timeout_stays_distinct_from_unavailability() {
        assert_eq!(
            ServiceError::from(SandboxError::Timeout).code(),
            "sandbox-timeout"
        );
        assert_eq!(
            ServiceError::from(SandboxError::Unavailable("503".into())).code(),
            "sandbox-unavailable"
        );
    }

    #[test]
    fn rejected_tokens_are_unauthenticated() {
        let err = ServiceError::from(IdentityError::Rejected("expired".into()));
        assert_eq!(err.code(), "unauthenticated");
        let err = ServiceError::from(IdentityError::Unavailable("connection refused".into()));
        assert_eq!(err.code(), "identity-unavailable");
    }
}
