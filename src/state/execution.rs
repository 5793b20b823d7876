use std::time::{Duration, SystemTime};

use indexmap::IndexMap;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique identifier of an execution request.
pub type RequestId = Uuid;

/// Lifecycle of an execution request.
///
/// `Rejected` and `Executed` are terminal: the gate drops the request as soon as it reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Waiting for every required voter to approve.
    Pending,
    /// Every required voter approved; the requester may run the program.
    Approved,
    /// One voter vetoed the request.
    Rejected,
    /// The requester ran the approved program.
    Executed,
}

/// A single voter decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Allow the execution.
    Approve,
    /// Veto the execution.
    Reject,
}

impl From<bool> for Decision {
    fn from(approved: bool) -> Self {
        if approved {
            Decision::Approve
        } else {
            Decision::Reject
        }
    }
}

/// Decision recorded for one voter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    /// Member id of the voter.
    pub voter_id: String,
    /// Display name of the voter at vote time.
    pub voter_name: String,
    /// What the voter decided.
    pub decision: Decision,
    /// When the decision was recorded.
    pub decided_at: SystemTime,
}

/// Program the requester asked to run, frozen at request time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSnapshot {
    /// Source code.
    pub code: String,
    /// Language tag.
    pub language: String,
    /// Program standard input.
    pub input: String,
}

/// The single in-flight execution request of a room.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Unique identifier of this request.
    pub id: RequestId,
    /// Member id of the requester.
    pub requester_id: String,
    /// Display name of the requester.
    pub requester_name: String,
    /// Program captured when the request was made.
    pub snapshot: ExecutionSnapshot,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Members whose approval is required, member id -> display name.
    pub required_voters: IndexMap<String, String>,
    /// Decisions in arrival order.
    pub approvals: Vec<Approval>,
    /// Current status.
    pub status: ExecutionStatus,
    expires_at: Option<Instant>,
}

impl ExecutionRequest {
    /// Number of approvals recorded so far.
    pub fn approved_count(&self) -> usize {
        self.approvals
            .iter()
            .filter(|approval| approval.decision == Decision::Approve)
            .count()
    }

    /// Number of approvals needed.
    pub fn total_voters(&self) -> usize {
        self.required_voters.len()
    }

    /// Whether `member_id` must vote on this request.
    pub fn is_voter(&self, member_id: &str) -> bool {
        self.required_voters.contains_key(member_id)
    }

    fn has_voted(&self, member_id: &str) -> bool {
        self.approvals
            .iter()
            .any(|approval| approval.voter_id == member_id)
    }

    fn settle(&mut self) -> VoteOutcome {
        let approved = self.approved_count();
        let total = self.total_voters();
        if approved >= total {
            self.status = ExecutionStatus::Approved;
            VoteOutcome::Approved(self.clone())
        } else {
            VoteOutcome::Progress { approved, total }
        }
    }
}

/// Result of asking for an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Nobody else is in the room; run without a vote.
    ExecuteDirectly,
    /// A request was recorded and voters must be asked.
    Pending {
        /// Identifier of the new request.
        id: RequestId,
        /// Number of votes required.
        total_voters: usize,
    },
}

/// Effect of a vote or of a voter leaving the room.
#[derive(Debug, Clone)]
pub enum VoteOutcome {
    /// Still waiting on other voters.
    Progress {
        /// Approvals so far.
        approved: usize,
        /// Approvals required.
        total: usize,
    },
    /// The last required approval arrived.
    Approved(ExecutionRequest),
    /// A voter vetoed; the request is gone.
    Rejected {
        /// The discarded request.
        request: ExecutionRequest,
        /// Member id of the voter who vetoed.
        voter_id: String,
        /// Display name of the voter who vetoed.
        voter_name: String,
    },
}

/// What happened to the request after a member left the room.
#[derive(Debug, Clone)]
pub enum DepartureOutcome {
    /// The requester left; the request was dropped.
    Cancelled(ExecutionRequest),
    /// A voter left and the tally changed.
    Voters(VoteOutcome),
}

/// Errors returned when asking for an execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// A pending or approved request already exists.
    #[error("an execution request is already pending")]
    AlreadyPending,
}

/// Errors returned when voting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoteError {
    /// Nothing is waiting for votes.
    #[error("no execution request is pending")]
    NoPending,
    /// Caller is not among the required voters.
    #[error("caller is not a voter")]
    NotAVoter,
    /// Caller already decided on this request.
    #[error("caller already voted")]
    AlreadyVoted,
}

/// Errors returned when cancelling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    /// There is no request to cancel.
    #[error("no execution request is pending")]
    NoPending,
    /// Caller did not make the request.
    #[error("caller is not the requester")]
    NotRequester,
}

/// Errors returned when running or completing an execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompleteError {
    /// There is no approved request.
    #[error("execution has not been approved")]
    NotApproved,
    /// Caller did not make the request.
    #[error("caller is not the requester")]
    NotRequester,
}

/// Per-room unanimous approval gate holding at most one request.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGate {
    current: Option<ExecutionRequest>,
    ttl: Option<Duration>,
}

impl ExecutionGate {
    /// Create a gate whose requests expire after `ttl`, or never when `None`.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self { current: None, ttl }
    }

    /// Request currently pending or approved.
    pub fn current(&self) -> Option<&ExecutionRequest> {
        self.current.as_ref()
    }

    /// Instant at which the current request expires.
    pub fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().and_then(|request| request.expires_at)
    }

    /// Ask to run `snapshot`; `voters` are the other active members, id -> display name.
    pub fn request(
        &mut self,
        requester_id: &str,
        requester_name: &str,
        snapshot: ExecutionSnapshot,
        mut voters: IndexMap<String, String>,
        now: Instant,
    ) -> Result<RequestOutcome, RequestError> {
        if self.current.is_some() {
            return Err(RequestError::AlreadyPending);
        }

        voters.shift_remove(requester_id);
        if voters.is_empty() {
            return Ok(RequestOutcome::ExecuteDirectly);
        }

        let request = ExecutionRequest {
            id: Uuid::new_v4(),
            requester_id: requester_id.to_string(),
            requester_name: requester_name.to_string(),
            snapshot,
            created_at: SystemTime::now(),
            required_voters: voters,
            approvals: Vec::new(),
            status: ExecutionStatus::Pending,
            expires_at: self.ttl.map(|ttl| now + ttl),
        };
        let outcome = RequestOutcome::Pending {
            id: request.id,
            total_voters: request.total_voters(),
        };
        self.current = Some(request);

        Ok(outcome)
    }

    /// Record a decision from `voter_id`.
    pub fn vote(
        &mut self,
        voter_id: &str,
        voter_name: &str,
        decision: Decision,
    ) -> Result<VoteOutcome, VoteError> {
        let request = self
            .current
            .as_mut()
            .filter(|request| request.status == ExecutionStatus::Pending)
            .ok_or(VoteError::NoPending)?;

        if !request.is_voter(voter_id) {
            return Err(VoteError::NotAVoter);
        }
        if request.has_voted(voter_id) {
            return Err(VoteError::AlreadyVoted);
        }

        request.approvals.push(Approval {
            voter_id: voter_id.to_string(),
            voter_name: voter_name.to_string(),
            decision,
            decided_at: SystemTime::now(),
        });

        match decision {
            Decision::Reject => {
                let mut request = self.current.take().ok_or(VoteError::NoPending)?;
                request.status = ExecutionStatus::Rejected;
                Ok(VoteOutcome::Rejected {
                    request,
                    voter_id: voter_id.to_string(),
                    voter_name: voter_name.to_string(),
                })
            }
            Decision::Approve => Ok(request.settle()),
        }
    }

    /// Drop the request on behalf of its requester.
    pub fn cancel(&mut self, requester_id: &str) -> Result<ExecutionRequest, CancelError> {
        let request = self.current.as_ref().ok_or(CancelError::NoPending)?;
        if request.requester_id != requester_id {
            return Err(CancelError::NotRequester);
        }
        self.current.take().ok_or(CancelError::NoPending)
    }

    /// Approved program `requester_id` may run now.
    pub fn authorized(&self, requester_id: &str) -> Result<&ExecutionSnapshot, CompleteError> {
        let request = self
            .current
            .as_ref()
            .filter(|request| request.status == ExecutionStatus::Approved)
            .ok_or(CompleteError::NotApproved)?;
        if request.requester_id != requester_id {
            return Err(CompleteError::NotRequester);
        }
        Ok(&request.snapshot)
    }

    /// Move the approved request to `executed` and clear it.
    pub fn complete(&mut self, requester_id: &str) -> Result<ExecutionRequest, CompleteError> {
        self.authorized(requester_id)?;
        let mut request = self.current.take().ok_or(CompleteError::NotApproved)?;
        request.status = ExecutionStatus::Executed;
        Ok(request)
    }

    /// React to the last connection of `member_id` leaving the room.
    pub fn member_departed(&mut self, member_id: &str) -> Option<DepartureOutcome> {
        let request = self.current.as_mut()?;

        if request.requester_id == member_id {
            return self.current.take().map(DepartureOutcome::Cancelled);
        }

        if request.status != ExecutionStatus::Pending || !request.is_voter(member_id) {
            return None;
        }

        request.required_voters.shift_remove(member_id);
        request
            .approvals
            .retain(|approval| approval.voter_id != member_id);

        Some(DepartureOutcome::Voters(request.settle()))
    }

    /// Drop the request if its deadline passed.
    pub fn expire(&mut self, now: Instant) -> Option<ExecutionRequest> {
        match self.deadline() {
            Some(deadline) if deadline <= now => self.current.take(),
            _ => None,
        }
    }
}
