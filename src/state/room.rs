//! Pure state of one live room.
//!
//! Every operation mutates the room and returns the notifications it produces as [`Delivery`]
//! values together with the writes to hand to the persistence gateway. Nothing here performs I/O:
//! the room actor decides how deliveries reach sockets and how persistence jobs are run.

use std::time::{Duration, SystemTime};

use indexmap::IndexSet;
use tokio::time::Instant;

use crate::{
    dao::models::{ChatMessageEntity, RoomEntity, SnapshotEntity},
    dto::{
        room::{
            ApprovalProgressEvent, CancelReason, ChatMessageDto, CodeUpdateEvent, CursorPosition,
            CursorUpdateEvent, ExecutionApprovedEvent, ExecutionCancelledEvent, ExecutionRejectedEvent,
            ExecutionRequestedEvent, InputUpdateEvent, JoinRoomResponse, OutputUpdateEvent,
            ParticipantSummary, PresenceEvent, RequestExecutionResponse, RoomEndedEvent,
        },
        ws::ServerMessage,
    },
    error::ServiceError,
    state::{
        chat::{ChatLog, ChatMessage, MAX_MESSAGE_CHARS},
        execution::{
            DepartureOutcome, ExecutionGate, ExecutionRequest, ExecutionSnapshot, RequestOutcome,
            VoteOutcome,
        },
        presence::{ActiveParticipant, ConnectionId, Presence},
    },
};

/// Tunables applied to every room.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// In-memory chat history bound.
    pub chat_capacity: usize,
    /// Lifetime of execution requests.
    pub execution_ttl: Option<Duration>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            chat_capacity: 500,
            execution_ttl: Some(Duration::from_secs(120)),
        }
    }
}

/// One notification and the connections that must receive it.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Target connections, resolved when the operation ran.
    pub recipients: Vec<ConnectionId>,
    /// Event to deliver.
    pub message: ServerMessage,
}

/// Write to hand to the persistence gateway.
#[derive(Debug, Clone)]
pub enum PersistJob {
    /// Append a chat message to the stored history.
    AppendMessage(ChatMessageEntity),
    /// Replace the stored code/input/output snapshot.
    SaveSnapshot(SnapshotEntity),
    /// Remove the room document.
    DeleteRoom,
}

/// Side effects of an operation.
#[derive(Debug, Default)]
pub struct Effects {
    /// Notifications in emission order.
    pub deliveries: Vec<Delivery>,
    /// Persistence writes in emission order.
    pub persist: Vec<PersistJob>,
}

impl Effects {
    fn deliver(&mut self, recipients: Vec<ConnectionId>, message: ServerMessage) {
        if !recipients.is_empty() {
            self.deliveries.push(Delivery {
                recipients,
                message,
            });
        }
    }
}

/// Reply to the caller plus the side effects of the operation.
#[derive(Debug)]
pub struct Outcome<T> {
    /// Value returned to the caller.
    pub reply: T,
    /// Notifications and writes.
    pub effects: Effects,
}

impl<T> Outcome<T> {
    fn new(reply: T, effects: Effects) -> Self {
        Self { reply, effects }
    }
}

/// Program cleared to run in the sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    /// Code, language and input to submit.
    pub program: ExecutionSnapshot,
    /// Set when the program comes from an approved request, which is closed after the run.
    pub from_request: bool,
}

/// Live state of one room.
#[derive(Debug)]
pub struct Room {
    id: String,
    name: String,
    owner_id: String,
    members: IndexSet<String>,
    code: String,
    language: String,
    input: String,
    output: String,
    show_output: bool,
    updated_by: Option<String>,
    updated_at: Option<SystemTime>,
    chat: ChatLog,
    presence: Presence,
    execution: ExecutionGate,
    ended: bool,
}

impl Room {
    /// Build the live state of a stored room.
    pub fn from_entity(entity: RoomEntity, settings: &RoomSettings) -> Self {
        let RoomEntity {
            id,
            name,
            owner_id,
            members,
            snapshot,
            messages,
        } = entity;

        Self {
            id,
            name,
            owner_id,
            members: members.into_iter().map(|m| m.member_id).collect(),
            code: snapshot.code,
            language: snapshot.language,
            input: snapshot.input,
            output: snapshot.output,
            show_output: snapshot.show_output,
            updated_by: snapshot.updated_by,
            updated_at: snapshot.updated_at,
            chat: ChatLog::restore(
                settings.chat_capacity,
                messages.into_iter().map(ChatMessage::from),
            ),
            presence: Presence::default(),
            execution: ExecutionGate::new(settings.execution_ttl),
            ended: false,
        }
    }

    /// Room identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connections present in the room.
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Chat history.
    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    /// Current code buffer and language.
    pub fn code(&self) -> (&str, &str) {
        (&self.code, &self.language)
    }

    /// Pending or approved execution request.
    pub fn execution(&self) -> Option<&ExecutionRequest> {
        self.execution.current()
    }

    /// When the current execution request expires.
    pub fn execution_deadline(&self) -> Option<Instant> {
        self.execution.deadline()
    }

    /// Whether the owner ended the room.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Whether `member_id` is allowed to join.
    pub fn is_member(&self, member_id: &str) -> bool {
        self.members.contains(member_id)
    }

    /// Replace the cached membership list with a fresher copy from storage.
    pub fn refresh_members(&mut self, entity: &RoomEntity) {
        self.members = entity.members.iter().map(|m| m.member_id.clone()).collect();
        self.owner_id = entity.owner_id.clone();
    }

    fn participant(&self, connection_id: &ConnectionId) -> Result<&ActiveParticipant, ServiceError> {
        self.presence
            .get(connection_id)
            .ok_or(ServiceError::NotActive)
    }

    fn active_summaries(&self) -> Vec<ParticipantSummary> {
        self.presence
            .participants()
            .map(ParticipantSummary::from)
            .collect()
    }

    fn snapshot_entity(&self) -> SnapshotEntity {
        SnapshotEntity {
            code: self.code.clone(),
            language: self.language.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            show_output: self.show_output,
            updated_by: self.updated_by.clone(),
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self, member_id: &str) {
        self.updated_by = Some(member_id.to_string());
        self.updated_at = Some(SystemTime::now());
    }

    /// Register `participant` and describe the room to it.
    pub fn join(
        &mut self,
        participant: ActiveParticipant,
    ) -> Result<Outcome<JoinRoomResponse>, ServiceError> {
        if self.ended {
            return Err(ServiceError::RoomNotFound(self.id.clone()));
        }
        if !self.is_member(&participant.member_id) {
            return Err(ServiceError::NotAMember);
        }

        let mut effects = Effects::default();
        let connection_id = participant.connection_id;
        let member_id = participant.member_id.clone();
        let display_name = participant.display_name.clone();

        if self.presence.insert(participant) {
            let notice =
                ChatMessage::system(&member_id, &display_name, format!("{display_name} joined the room"));
            let others = self.presence.connections_except(&connection_id);
            effects.deliver(
                others.clone(),
                ServerMessage::ParticipantJoined(PresenceEvent {
                    room_id: self.id.clone(),
                    member_id,
                    display_name,
                    active_participants: self.active_summaries(),
                }),
            );
            effects.deliver(others, ServerMessage::ReceiveMessage((&notice).into()));
        }

        let reply = JoinRoomResponse {
            room_id: self.id.clone(),
            room_name: self.name.clone(),
            owner_id: self.owner_id.clone(),
            active_participants: self.active_summaries(),
            code: self.code.clone(),
            language: self.language.clone(),
            input: self.input.clone(),
            output: self.output.clone(),
            show_output: self.show_output,
            messages: self.chat.iter().map(ChatMessageDto::from).collect(),
            pending_execution: self
                .execution
                .current()
                .map(|request| ExecutionRequestedEvent::new(&self.id, request)),
        };

        Ok(Outcome::new(reply, effects))
    }

    /// Remove a connection. Returns `false` when it was not present.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> Outcome<bool> {
        let mut effects = Effects::default();
        let Some(gone) = self.presence.remove(connection_id) else {
            return Outcome::new(false, effects);
        };

        let remaining = self.presence.connections();
        let notice = ChatMessage::system(
            &gone.member_id,
            &gone.display_name,
            format!("{} left the room", gone.display_name),
        );
        effects.deliver(
            remaining.clone(),
            ServerMessage::ParticipantLeft(PresenceEvent {
                room_id: self.id.clone(),
                member_id: gone.member_id.clone(),
                display_name: gone.display_name.clone(),
                active_participants: self.active_summaries(),
            }),
        );
        effects.deliver(remaining, ServerMessage::ReceiveMessage((&notice).into()));

        if !self.presence.has_member(&gone.member_id) {
            match self.execution.member_departed(&gone.member_id) {
                Some(DepartureOutcome::Cancelled(request)) => {
                    self.announce_cancelled(&mut effects, &request, CancelReason::RequesterLeft);
                }
                Some(DepartureOutcome::Voters(outcome)) => {
                    self.announce_vote(&mut effects, outcome);
                }
                None => {}
            }
        }

        Outcome::new(true, effects)
    }

    /// Overwrite the code buffer and language.
    pub fn edit_code(
        &mut self,
        connection_id: &ConnectionId,
        code: String,
        language: String,
    ) -> Result<Outcome<()>, ServiceError> {
        let member_id = self.participant(connection_id)?.member_id.clone();
        self.code = code;
        self.language = language;
        self.touch(&member_id);

        let mut effects = Effects::default();
        effects.persist.push(PersistJob::SaveSnapshot(self.snapshot_entity()));
        effects.deliver(
            self.presence.connections_except(connection_id),
            ServerMessage::CodeUpdate(CodeUpdateEvent {
                room_id: self.id.clone(),
                code: self.code.clone(),
                language: self.language.clone(),
                updated_by: member_id,
            }),
        );
        Ok(Outcome::new((), effects))
    }

    /// Overwrite the program input pane.
    pub fn edit_input(
        &mut self,
        connection_id: &ConnectionId,
        input: String,
    ) -> Result<Outcome<()>, ServiceError> {
        let member_id = self.participant(connection_id)?.member_id.clone();
        self.input = input;
        self.touch(&member_id);

        let mut effects = Effects::default();
        effects.persist.push(PersistJob::SaveSnapshot(self.snapshot_entity()));
        effects.deliver(
            self.presence.connections_except(connection_id),
            ServerMessage::InputUpdate(InputUpdateEvent {
                room_id: self.id.clone(),
                input: self.input.clone(),
                updated_by: member_id,
            }),
        );
        Ok(Outcome::new((), effects))
    }

    /// Overwrite the program output pane and its visibility.
    pub fn edit_output(
        &mut self,
        connection_id: &ConnectionId,
        output: String,
        show_output: bool,
    ) -> Result<Outcome<()>, ServiceError> {
        let member_id = self.participant(connection_id)?.member_id.clone();
        self.output = output;
        self.show_output = show_output;
        self.touch(&member_id);

        let mut effects = Effects::default();
        effects.persist.push(PersistJob::SaveSnapshot(self.snapshot_entity()));
        effects.deliver(
            self.presence.connections(),
            ServerMessage::OutputUpdate(OutputUpdateEvent {
                room_id: self.id.clone(),
                output: self.output.clone(),
                show_output,
                updated_by: member_id,
            }),
        );
        Ok(Outcome::new((), effects))
    }

    /// Append a participant message to the chat.
    pub fn send_message(
        &mut self,
        connection_id: &ConnectionId,
        body: String,
    ) -> Result<Outcome<ChatMessageDto>, ServiceError> {
        let author = self.participant(connection_id)?;
        if body.trim().is_empty() {
            return Err(ServiceError::InvalidInput("message body is empty".into()));
        }
        if body.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ServiceError::InvalidInput(format!(
                "message body exceeds {MAX_MESSAGE_CHARS} characters"
            )));
        }

        let message = ChatMessage::message(&author.member_id, &author.display_name, body);
        let dto = ChatMessageDto::from(&message);

        let mut effects = Effects::default();
        effects
            .persist
            .push(PersistJob::AppendMessage(ChatMessageEntity::from(&message)));
        effects.deliver(
            self.presence.connections(),
            ServerMessage::ReceiveMessage(dto.clone()),
        );
        self.chat.append(message);

        Ok(Outcome::new(dto, effects))
    }

    /// Relay a cursor position to the other participants. Nothing is stored.
    pub fn move_cursor(
        &self,
        connection_id: &ConnectionId,
        position: CursorPosition,
    ) -> Result<Outcome<()>, ServiceError> {
        let mover = self.participant(connection_id)?;
        let event = CursorUpdateEvent {
            room_id: self.id.clone(),
            member_id: mover.member_id.clone(),
            display_name: mover.display_name.clone(),
            position,
        };

        let mut effects = Effects::default();
        effects.deliver(
            self.presence.connections_except(connection_id),
            ServerMessage::CursorUpdate(event),
        );
        Ok(Outcome::new((), effects))
    }

    /// Ask the other members for permission to run `snapshot`.
    pub fn request_execution(
        &mut self,
        connection_id: &ConnectionId,
        snapshot: ExecutionSnapshot,
        now: Instant,
    ) -> Result<Outcome<RequestExecutionResponse>, ServiceError> {
        let requester = self.participant(connection_id)?.clone();
        let voters = self.presence.other_members(&requester.member_id);

        let outcome = self.execution.request(
            &requester.member_id,
            &requester.display_name,
            snapshot,
            voters,
            now,
        )?;

        let mut effects = Effects::default();
        let reply = match outcome {
            RequestOutcome::ExecuteDirectly => RequestExecutionResponse {
                execute_directly: true,
                request_id: None,
                pending_total_voters: None,
            },
            RequestOutcome::Pending { id, total_voters } => {
                if let Some(request) = self.execution.current() {
                    effects.deliver(
                        self.presence.connections_of(request.required_voters.keys()),
                        ServerMessage::ExecutionRequested(ExecutionRequestedEvent::new(
                            &self.id, request,
                        )),
                    );
                }
                RequestExecutionResponse {
                    execute_directly: false,
                    request_id: Some(id.to_string()),
                    pending_total_voters: Some(total_voters),
                }
            }
        };

        Ok(Outcome::new(reply, effects))
    }

    /// Record the caller's decision on the pending request.
    pub fn submit_vote(
        &mut self,
        connection_id: &ConnectionId,
        approved: bool,
    ) -> Result<Outcome<()>, ServiceError> {
        let voter = self.participant(connection_id)?.clone();
        let outcome = self
            .execution
            .vote(&voter.member_id, &voter.display_name, approved.into())?;

        let mut effects = Effects::default();
        self.announce_vote(&mut effects, outcome);
        Ok(Outcome::new((), effects))
    }

    /// Drop the caller's own request.
    pub fn cancel_execution(
        &mut self,
        connection_id: &ConnectionId,
    ) -> Result<Outcome<()>, ServiceError> {
        let member_id = self.participant(connection_id)?.member_id.clone();
        let request = self.execution.cancel(&member_id)?;

        let mut effects = Effects::default();
        self.announce_cancelled(&mut effects, &request, CancelReason::Requested);
        Ok(Outcome::new((), effects))
    }

    /// Close the caller's approved request once it ran.
    pub fn mark_executed(
        &mut self,
        connection_id: &ConnectionId,
    ) -> Result<Outcome<()>, ServiceError> {
        let member_id = self.participant(connection_id)?.member_id.clone();
        self.execution.complete(&member_id)?;
        Ok(Outcome::new((), Effects::default()))
    }

    /// Program the caller may send to the sandbox right now.
    ///
    /// An approved request by the caller yields its request-time snapshot. A caller alone in the
    /// room with no request in flight may run `requested` as is.
    pub fn authorize_execution(
        &self,
        connection_id: &ConnectionId,
        requested: ExecutionSnapshot,
    ) -> Result<Authorization, ServiceError> {
        let member_id = &self.participant(connection_id)?.member_id;
        match self.execution.current() {
            Some(_) => Ok(Authorization {
                program: self.execution.authorized(member_id)?.clone(),
                from_request: true,
            }),
            None if self.presence.other_members(member_id).is_empty() => Ok(Authorization {
                program: requested,
                from_request: false,
            }),
            None => Err(ServiceError::ExecutionNotApproved),
        }
    }

    /// Drop the execution request when its lifetime is over.
    pub fn expire_execution(&mut self, now: Instant) -> Effects {
        let mut effects = Effects::default();
        if let Some(request) = self.execution.expire(now) {
            self.announce_cancelled(&mut effects, &request, CancelReason::Expired);
        }
        effects
    }

    /// End the room on behalf of its owner, evicting every connection.
    pub fn end(&mut self, connection_id: &ConnectionId) -> Result<Outcome<()>, ServiceError> {
        let caller = self.participant(connection_id)?;
        if caller.member_id != self.owner_id {
            return Err(ServiceError::NotOwner);
        }

        let event = RoomEndedEvent {
            room_id: self.id.clone(),
            ended_by_id: caller.member_id.clone(),
            ended_by_name: caller.display_name.clone(),
        };

        let mut effects = Effects::default();
        effects.deliver(self.presence.connections(), ServerMessage::RoomEnded(event));
        effects.persist.push(PersistJob::DeleteRoom);

        self.presence.drain();
        self.execution = ExecutionGate::new(None);
        self.ended = true;

        Ok(Outcome::new((), effects))
    }

    fn announce_vote(&self, effects: &mut Effects, outcome: VoteOutcome) {
        let everyone = self.presence.connections();
        match outcome {
            VoteOutcome::Progress { approved, total } => {
                let Some(request) = self.execution.current() else {
                    return;
                };
                effects.deliver(
                    everyone,
                    ServerMessage::ExecutionApprovalProgress(ApprovalProgressEvent {
                        room_id: self.id.clone(),
                        request_id: request.id.to_string(),
                        approved_count: approved,
                        total_voters: total,
                    }),
                );
            }
            VoteOutcome::Approved(request) => {
                effects.deliver(
                    everyone,
                    ServerMessage::ExecutionApproved(ExecutionApprovedEvent::new(
                        &self.id, &request,
                    )),
                );
            }
            VoteOutcome::Rejected {
                request,
                voter_id,
                voter_name,
            } => {
                effects.deliver(
                    everyone,
                    ServerMessage::ExecutionRejected(ExecutionRejectedEvent {
                        room_id: self.id.clone(),
                        request_id: request.id.to_string(),
                        rejected_by_id: voter_id,
                        rejected_by_name: voter_name,
                    }),
                );
            }
        }
    }

    fn announce_cancelled(
        &self,
        effects: &mut Effects,
        request: &ExecutionRequest,
        reason: CancelReason,
    ) {
        effects.deliver(
            self.presence.connections(),
            ServerMessage::ExecutionCancelled(ExecutionCancelledEvent {
                room_id: self.id.clone(),
                request_id: request.id.to_string(),
                reason,
            }),
        );
    }
}
