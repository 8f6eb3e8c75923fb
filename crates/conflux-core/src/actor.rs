use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

use conflux_config::TopologySettings;

use crate::error::MeetingError;
use crate::events::{MeetingEventBus, MembershipEvent, TransitionEvent};
use crate::hte::HysteresisPolicy;
use crate::ids::{ConsumerId, MeetingId, ParticipantId, ProducerId, TransportId};
use crate::media_backend::{
    ConsumerDescriptor, MediaBackendFactory, ProducerDescriptor, TransportDescriptor,
};
use crate::model::{
    Consumer, MediaState, MeetingOptions, MeetingSnapshot, Participant, PreferredLayers, Producer,
    ProducerKind, QualitySample, SourceTag, TopologyModeTag, TransitionRecord, default_encodings,
};
use crate::topology::TopologyState;

/// Messages accepted by a meeting actor's mailbox. Every mutation to a
/// meeting's state goes through this channel so the actor is the single
/// writer (§9 "Async everywhere → actor mailbox"), removing the need for
/// interior-mutability locking across the whole meeting.
pub enum Command {
    Join {
        participant_id: ParticipantId,
        display_name: Option<String>,
        host: bool,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    Leave {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    Suspend {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    Resume {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    SetMediaState {
        participant_id: ParticipantId,
        state: MediaState,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    ReportQuality {
        participant_id: ParticipantId,
        sample: QualitySample,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    AckTransition {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    RemoveProducer {
        producer_id: ProducerId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    GetSnapshot {
        reply: oneshot::Sender<MeetingSnapshot>,
    },
    /// Scheduled `ghost_grace_ms` after a connection drops (§4.5). A no-op
    /// if the participant reconnected (and was resumed) in the meantime.
    FinalizeIfSuspended {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    /// True if `participant_id` is already a member (used by the gateway
    /// to decide whether `join-room` means join or reconnect).
    IsMember {
        participant_id: ParticipantId,
        reply: oneshot::Sender<bool>,
    },
    /// SFU control-plane operations. Serialized through the actor per the
    /// concurrency model: only the bookkeeping (who owns which
    /// transport/producer/consumer) happens here; the actual media-worker
    /// RPC runs on the router's own async call, which suspends the actor
    /// task but not the mailbox itself isn't blocked for other meetings.
    RouterCapabilities {
        reply: oneshot::Sender<Result<serde_json::Value, MeetingError>>,
    },
    SetRtpCapabilities {
        participant_id: ParticipantId,
        rtp_capabilities: serde_json::Value,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    /// The capabilities a participant registered via `SetRtpCapabilities`,
    /// if any — used to auto-wire consumers for existing participants when
    /// a new producer appears (§4.3).
    GetRtpCapabilities {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Option<serde_json::Value>>,
    },
    CreateTransport {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Result<TransportDescriptor, MeetingError>>,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: serde_json::Value,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    Produce {
        participant_id: ParticipantId,
        transport_id: TransportId,
        kind: ProducerKind,
        source: SourceTag,
        rtp_parameters: serde_json::Value,
        reply: oneshot::Sender<Result<ProducerDescriptor, MeetingError>>,
    },
    Consume {
        participant_id: ParticipantId,
        producer_id: ProducerId,
        rtp_capabilities: serde_json::Value,
        reply: oneshot::Sender<Result<ConsumerDescriptor, MeetingError>>,
    },
    SetPreferredLayers {
        consumer_id: ConsumerId,
        layers: PreferredLayers,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    PauseProducer {
        producer_id: ProducerId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    ResumeProducer {
        producer_id: ProducerId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    PauseConsumer {
        consumer_id: ConsumerId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
        reply: oneshot::Sender<Result<(), MeetingError>>,
    },
    /// Other participants' producers, for the `new-producer` catch-up a
    /// freshly consuming participant needs.
    ListOtherProducers {
        participant_id: ParticipantId,
        reply: oneshot::Sender<Vec<(ParticipantId, ProducerId, ProducerKind)>>,
    },
    /// A media worker died; if this meeting's router was backed by it,
    /// rebuild the router against whichever worker the pool hands back
    /// next (§4.7's "notifies affected MLMs for re-allocation"). Fire and
    /// forget — there's no caller waiting on a reply.
    ReconcileRouter {
        dead_worker_tag: String,
    },
    Tick,
    Shutdown,
}

/// A clonable, cheap-to-hold reference to a running meeting actor. Callers
/// never touch meeting state directly; they send a `Command` and await the
/// reply, mirroring how the reference stack's `RoomManager` serializes
/// access through a single `Mutex`-guarded map but without holding a lock
/// across an `.await`.
#[derive(Clone)]
pub struct MeetingHandle {
    sender: mpsc::Sender<Command>,
    pub events: Arc<MeetingEventBus>,
}

impl MeetingHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, MeetingError>>) -> Command,
    ) -> Result<T, MeetingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| MeetingError::MailboxClosed)?;
        rx.await.map_err(|_| MeetingError::MailboxClosed)?
    }

    pub async fn join(
        &self,
        participant_id: ParticipantId,
        display_name: Option<String>,
        host: bool,
    ) -> Result<(), MeetingError> {
        self.call(|reply| Command::Join {
            participant_id,
            display_name,
            host,
            reply,
        })
        .await
    }

    pub async fn leave(&self, participant_id: ParticipantId) -> Result<(), MeetingError> {
        self.call(|reply| Command::Leave {
            participant_id,
            reply,
        })
        .await
    }

    pub async fn suspend(&self, participant_id: ParticipantId) -> Result<(), MeetingError> {
        self.call(|reply| Command::Suspend {
            participant_id,
            reply,
        })
        .await
    }

    pub async fn resume(&self, participant_id: ParticipantId) -> Result<(), MeetingError> {
        self.call(|reply| Command::Resume {
            participant_id,
            reply,
        })
        .await
    }

    pub async fn set_media_state(
        &self,
        participant_id: ParticipantId,
        state: MediaState,
    ) -> Result<(), MeetingError> {
        self.call(|reply| Command::SetMediaState {
            participant_id,
            state,
            reply,
        })
        .await
    }

    pub async fn report_quality(
        &self,
        participant_id: ParticipantId,
        sample: QualitySample,
    ) -> Result<(), MeetingError> {
        self.call(|reply| Command::ReportQuality {
            participant_id,
            sample,
            reply,
        })
        .await
    }

    pub async fn ack_transition(&self, participant_id: ParticipantId) -> Result<(), MeetingError> {
        self.call(|reply| Command::AckTransition {
            participant_id,
            reply,
        })
        .await
    }

    pub async fn remove_producer(&self, producer_id: ProducerId) -> Result<(), MeetingError> {
        self.call(|reply| Command::RemoveProducer {
            producer_id,
            reply,
        })
        .await
    }

    pub async fn finalize_if_suspended(
        &self,
        participant_id: ParticipantId,
    ) -> Result<(), MeetingError> {
        self.call(|reply| Command::FinalizeIfSuspended {
            participant_id,
            reply,
        })
        .await
    }

    pub async fn is_member(&self, participant_id: ParticipantId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(Command::IsMember {
                participant_id,
                reply: tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn snapshot(&self) -> Result<MeetingSnapshot, MeetingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::GetSnapshot { reply: tx })
            .await
            .map_err(|_| MeetingError::MailboxClosed)?;
        rx.await.map_err(|_| MeetingError::MailboxClosed)
    }

    pub async fn router_capabilities(&self) -> Result<serde_json::Value, MeetingError> {
        self.call(|reply| Command::RouterCapabilities { reply }).await
    }

    pub async fn set_rtp_capabilities(
        &self,
        participant_id: ParticipantId,
        rtp_capabilities: serde_json::Value,
    ) -> Result<(), MeetingError> {
        self.call(|reply| Command::SetRtpCapabilities {
            participant_id,
            rtp_capabilities,
            reply,
        })
        .await
    }

    pub async fn rtp_capabilities_of(&self, participant_id: ParticipantId) -> Option<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(Command::GetRtpCapabilities {
                participant_id,
                reply: tx,
            })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn create_transport(
        &self,
        participant_id: ParticipantId,
    ) -> Result<TransportDescriptor, MeetingError> {
        self.call(|reply| Command::CreateTransport {
            participant_id,
            reply,
        })
        .await
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: serde_json::Value,
    ) -> Result<(), MeetingError> {
        self.call(|reply| Command::ConnectTransport {
            transport_id,
            dtls_parameters,
            reply,
        })
        .await
    }

    pub async fn produce(
        &self,
        participant_id: ParticipantId,
        transport_id: TransportId,
        kind: ProducerKind,
        source: SourceTag,
        rtp_parameters: serde_json::Value,
    ) -> Result<ProducerDescriptor, MeetingError> {
        self.call(|reply| Command::Produce {
            participant_id,
            transport_id,
            kind,
            source,
            rtp_parameters,
            reply,
        })
        .await
    }

    pub async fn consume(
        &self,
        participant_id: ParticipantId,
        producer_id: ProducerId,
        rtp_capabilities: serde_json::Value,
    ) -> Result<ConsumerDescriptor, MeetingError> {
        self.call(|reply| Command::Consume {
            participant_id,
            producer_id,
            rtp_capabilities,
            reply,
        })
        .await
    }

    pub async fn set_preferred_layers(
        &self,
        consumer_id: ConsumerId,
        layers: PreferredLayers,
    ) -> Result<(), MeetingError> {
        self.call(|reply| Command::SetPreferredLayers {
            consumer_id,
            layers,
            reply,
        })
        .await
    }

    pub async fn pause_producer(&self, producer_id: ProducerId) -> Result<(), MeetingError> {
        self.call(|reply| Command::PauseProducer { producer_id, reply }).await
    }

    pub async fn resume_producer(&self, producer_id: ProducerId) -> Result<(), MeetingError> {
        self.call(|reply| Command::ResumeProducer { producer_id, reply }).await
    }

    pub async fn pause_consumer(&self, consumer_id: ConsumerId) -> Result<(), MeetingError> {
        self.call(|reply| Command::PauseConsumer { consumer_id, reply }).await
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), MeetingError> {
        self.call(|reply| Command::ResumeConsumer { consumer_id, reply }).await
    }

    pub async fn list_other_producers(
        &self,
        participant_id: ParticipantId,
    ) -> Vec<(ParticipantId, ProducerId, ProducerKind)> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(Command::ListOtherProducers {
                participant_id,
                reply: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Tells this meeting a media worker died, in case its router was on
    /// it. A no-op if the meeting is in mesh mode or its router was backed
    /// by a different worker.
    pub async fn notify_worker_lost(&self, dead_worker_tag: String) {
        let _ = self.sender.send(Command::ReconcileRouter { dead_worker_tag }).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown).await;
    }
}

const MAILBOX_CAPACITY: usize = 512;

/// Owns all mutable state for one meeting: the single writer behind a
/// `MeetingHandle`. Spawned onto its own task by the meeting registry.
pub struct MeetingActor {
    id: MeetingId,
    created_at: chrono::DateTime<Utc>,
    host_id: ParticipantId,
    options: MeetingOptions,
    participants: HashMap<ParticipantId, Participant>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
    topology: TopologyState,
    transition_history: Vec<TransitionRecord>,
    last_transition_time: Option<chrono::DateTime<Utc>>,
    media_factory: Arc<dyn MediaBackendFactory>,
    settings: TopologySettings,
    events: Arc<MeetingEventBus>,
    receiver: mpsc::Receiver<Command>,
}

impl MeetingActor {
    pub fn spawn(
        id: MeetingId,
        host_id: ParticipantId,
        host_display_name: Option<String>,
        options: MeetingOptions,
        media_factory: Arc<dyn MediaBackendFactory>,
        settings: TopologySettings,
    ) -> MeetingHandle {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let events = Arc::new(MeetingEventBus::new());

        let mut participants = HashMap::new();
        participants.insert(
            host_id.clone(),
            Participant::new(host_id.clone(), host_display_name, true),
        );

        let actor = MeetingActor {
            id,
            created_at: Utc::now(),
            host_id,
            options,
            participants,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            topology: TopologyState::Mesh,
            transition_history: Vec::new(),
            last_transition_time: None,
            media_factory,
            settings,
            events: events.clone(),
            receiver,
        };

        tokio::spawn(actor.run());

        MeetingHandle { sender, events }
    }

    #[instrument(skip(self), fields(meeting_id = %self.id))]
    async fn run(mut self) {
        self.initialize_topology().await;

        let mut quality_timer =
            tokio::time::interval(std::time::Duration::from_millis(self.settings.quality_check_interval_ms));

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle(cmd).await,
                    }
                }
                _ = quality_timer.tick() => {
                    self.evaluate_topology().await;
                }
            }
        }

        if let Some(router) = self.topology.router() {
            router.close().await;
        }
        info!("meeting actor stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Join {
                participant_id,
                display_name,
                host,
                reply,
            } => {
                let result = self.join(participant_id, display_name, host);
                let _ = reply.send(result);
            }
            Command::Leave {
                participant_id,
                reply,
            } => {
                let result = self.leave(participant_id).await;
                let _ = reply.send(result);
            }
            Command::Suspend {
                participant_id,
                reply,
            } => {
                let result = self.suspend(participant_id);
                let _ = reply.send(result);
            }
            Command::Resume {
                participant_id,
                reply,
            } => {
                let result = self.resume(participant_id);
                let _ = reply.send(result);
            }
            Command::SetMediaState {
                participant_id,
                state,
                reply,
            } => {
                let result = self.set_media_state(participant_id, state);
                let _ = reply.send(result);
            }
            Command::ReportQuality {
                participant_id,
                sample,
                reply,
            } => {
                let result = self.report_quality(participant_id, sample);
                let _ = reply.send(result);
                self.evaluate_topology().await;
            }
            Command::AckTransition {
                participant_id,
                reply,
            } => {
                let result = self.ack_transition(participant_id);
                let _ = reply.send(result);
            }
            Command::RemoveProducer { producer_id, reply } => {
                let result = self.remove_producer(producer_id);
                let _ = reply.send(result);
            }
            Command::GetSnapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::FinalizeIfSuspended {
                participant_id,
                reply,
            } => {
                let result = self.finalize_if_suspended(participant_id).await;
                let _ = reply.send(result);
            }
            Command::IsMember {
                participant_id,
                reply,
            } => {
                let _ = reply.send(self.participants.contains_key(&participant_id));
            }
            Command::RouterCapabilities { reply } => {
                let result = match self.topology.router() {
                    Some(router) => Ok(router.router_rtp_capabilities().await),
                    None => Err(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable)),
                };
                let _ = reply.send(result);
            }
            Command::SetRtpCapabilities {
                participant_id,
                rtp_capabilities,
                reply,
            } => {
                let result = match self.participants.get_mut(&participant_id) {
                    Some(p) => {
                        p.rtp_capabilities = Some(rtp_capabilities);
                        Ok(())
                    }
                    None => Err(MeetingError::ParticipantNotFound(participant_id)),
                };
                let _ = reply.send(result);
            }
            Command::GetRtpCapabilities {
                participant_id,
                reply,
            } => {
                let caps = self
                    .participants
                    .get(&participant_id)
                    .and_then(|p| p.rtp_capabilities.clone());
                let _ = reply.send(caps);
            }
            Command::CreateTransport {
                participant_id,
                reply,
            } => {
                let result = self.create_transport(participant_id).await;
                let _ = reply.send(result);
            }
            Command::ConnectTransport {
                transport_id,
                dtls_parameters,
                reply,
            } => {
                let result = match self.topology.router() {
                    Some(router) => router
                        .connect_transport(&transport_id, dtls_parameters)
                        .await
                        .map_err(MeetingError::from),
                    None => Err(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable)),
                };
                let _ = reply.send(result);
            }
            Command::Produce {
                participant_id,
                transport_id,
                kind,
                source,
                rtp_parameters,
                reply,
            } => {
                let result = self
                    .produce(participant_id, transport_id, kind, source, rtp_parameters)
                    .await;
                let _ = reply.send(result);
            }
            Command::Consume {
                participant_id,
                producer_id,
                rtp_capabilities,
                reply,
            } => {
                let result = self.consume(participant_id, producer_id, rtp_capabilities).await;
                let _ = reply.send(result);
            }
            Command::SetPreferredLayers {
                consumer_id,
                layers,
                reply,
            } => {
                let result = self.set_preferred_layers(consumer_id, layers).await;
                let _ = reply.send(result);
            }
            Command::PauseProducer { producer_id, reply } => {
                let result = self.pause_producer(producer_id).await;
                let _ = reply.send(result);
            }
            Command::ResumeProducer { producer_id, reply } => {
                let result = self.resume_producer(producer_id).await;
                let _ = reply.send(result);
            }
            Command::PauseConsumer { consumer_id, reply } => {
                let result = self.pause_consumer(consumer_id).await;
                let _ = reply.send(result);
            }
            Command::ResumeConsumer { consumer_id, reply } => {
                let result = self.resume_consumer(consumer_id).await;
                let _ = reply.send(result);
            }
            Command::ListOtherProducers {
                participant_id,
                reply,
            } => {
                let result = self.list_other_producers(participant_id);
                let _ = reply.send(result);
            }
            Command::ReconcileRouter { dead_worker_tag } => {
                self.reconcile_router(dead_worker_tag).await;
            }
            Command::Tick => {
                self.evaluate_topology().await;
            }
            Command::Shutdown => unreachable!("handled in run()"),
        }
    }

    fn join(
        &mut self,
        participant_id: ParticipantId,
        display_name: Option<String>,
        host: bool,
    ) -> Result<(), MeetingError> {
        if self.participants.contains_key(&participant_id) {
            return Err(MeetingError::ParticipantAlreadyJoined(participant_id));
        }
        if self.participants.len() as u32 >= self.options.max_participants {
            return Err(MeetingError::MeetingFull {
                meeting: self.id.clone(),
                max: self.options.max_participants,
            });
        }

        let participant = Participant::new(participant_id.clone(), display_name.clone(), host);
        self.participants.insert(participant_id.clone(), participant);

        let _ = self.events.membership.send(MembershipEvent::ParticipantJoined {
            participant_id,
            display_name,
        });

        Ok(())
    }

    async fn leave(&mut self, participant_id: ParticipantId) -> Result<(), MeetingError> {
        let participant = self
            .participants
            .remove(&participant_id)
            .ok_or_else(|| MeetingError::ParticipantNotFound(participant_id.clone()))?;

        if let Some(router) = self.topology.router() {
            for producer_id in &participant.producers {
                let _ = router.close_producer(producer_id).await;
            }
            for consumer_id in &participant.consumers {
                let _ = router.close_consumer(consumer_id).await;
            }
        }
        for producer_id in &participant.producers {
            self.producers.remove(producer_id);
        }
        for consumer_id in &participant.consumers {
            self.consumers.remove(consumer_id);
        }

        let _ = self
            .events
            .membership
            .send(MembershipEvent::ParticipantLeft { participant_id: participant_id.clone() });

        if participant.host {
            if let Some(next_host_id) = self.participants.keys().next().cloned() {
                if let Some(next) = self.participants.get_mut(&next_host_id) {
                    next.host = true;
                }
                let _ = self
                    .events
                    .membership
                    .send(MembershipEvent::HostTransferred { new_host: next_host_id });
            }
        }

        Ok(())
    }

    fn suspend(&mut self, participant_id: ParticipantId) -> Result<(), MeetingError> {
        let participant = self
            .participants
            .get_mut(&participant_id)
            .ok_or_else(|| MeetingError::ParticipantNotFound(participant_id.clone()))?;
        participant.suspended = true;
        let _ = self
            .events
            .membership
            .send(MembershipEvent::ParticipantSuspended { participant_id });
        Ok(())
    }

    fn resume(&mut self, participant_id: ParticipantId) -> Result<(), MeetingError> {
        let participant = self
            .participants
            .get_mut(&participant_id)
            .ok_or_else(|| MeetingError::ParticipantNotFound(participant_id.clone()))?;
        participant.suspended = false;
        let _ = self
            .events
            .membership
            .send(MembershipEvent::ParticipantResumed { participant_id });
        Ok(())
    }

    async fn finalize_if_suspended(
        &mut self,
        participant_id: ParticipantId,
    ) -> Result<(), MeetingError> {
        match self.participants.get(&participant_id) {
            Some(p) if p.suspended => self.leave(participant_id).await,
            _ => Ok(()),
        }
    }

    fn set_media_state(
        &mut self,
        participant_id: ParticipantId,
        state: MediaState,
    ) -> Result<(), MeetingError> {
        let participant = self
            .participants
            .get_mut(&participant_id)
            .ok_or_else(|| MeetingError::ParticipantNotFound(participant_id.clone()))?;
        participant.media_state = state;
        let _ = self
            .events
            .membership
            .send(MembershipEvent::MediaStateChanged { participant_id, state });
        Ok(())
    }

    fn report_quality(
        &mut self,
        participant_id: ParticipantId,
        sample: QualitySample,
    ) -> Result<(), MeetingError> {
        let participant = self
            .participants
            .get_mut(&participant_id)
            .ok_or(MeetingError::ParticipantNotFound(participant_id))?;
        participant.quality.push(sample);
        Ok(())
    }

    fn ack_transition(&mut self, participant_id: ParticipantId) -> Result<(), MeetingError> {
        match &mut self.topology {
            TopologyState::Transitioning { acked, .. } => {
                acked.insert(participant_id.clone());
                let _ = self
                    .events
                    .transitions
                    .send(TransitionEvent::ParticipantAcked { participant_id });
                Ok(())
            }
            _ => Err(MeetingError::TransitionInProgress(self.id.clone())),
        }
    }

    fn remove_producer(&mut self, producer_id: ProducerId) -> Result<(), MeetingError> {
        for participant in self.participants.values_mut() {
            participant.producers.retain(|p| p != &producer_id);
        }
        self.producers.remove(&producer_id);
        self.consumers.retain(|_, c| c.producer_id != producer_id);
        Ok(())
    }

    fn list_other_producers(
        &self,
        participant_id: ParticipantId,
    ) -> Vec<(ParticipantId, ProducerId, ProducerKind)> {
        self.producers
            .values()
            .filter(|p| p.owner != participant_id)
            .map(|p| (p.owner.clone(), p.id.clone(), p.kind))
            .collect()
    }

    async fn create_transport(
        &mut self,
        participant_id: ParticipantId,
    ) -> Result<TransportDescriptor, MeetingError> {
        let router = self
            .topology
            .router()
            .ok_or(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable))?;
        let participant = self
            .participants
            .get_mut(&participant_id)
            .ok_or_else(|| MeetingError::ParticipantNotFound(participant_id.clone()))?;

        let descriptor = router.create_transport().await?;

        if participant.transports.send.is_none() {
            participant.transports.send = Some(descriptor.id.clone());
        } else {
            participant.transports.recv = Some(descriptor.id.clone());
        }

        Ok(descriptor)
    }

    async fn produce(
        &mut self,
        participant_id: ParticipantId,
        transport_id: TransportId,
        kind: ProducerKind,
        source: SourceTag,
        rtp_parameters: serde_json::Value,
    ) -> Result<ProducerDescriptor, MeetingError> {
        let router = self
            .topology
            .router()
            .ok_or(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable))?;
        if !self.participants.contains_key(&participant_id) {
            return Err(MeetingError::ParticipantNotFound(participant_id));
        }

        let encodings = default_encodings(source);
        let descriptor = router
            .produce(&transport_id, kind, rtp_parameters, encodings.clone())
            .await?;

        let producer = Producer {
            id: descriptor.id.clone(),
            owner: participant_id.clone(),
            kind,
            source,
            encodings,
            paused: false,
            live_score: 10,
        };
        self.producers.insert(producer.id.clone(), producer);

        if let Some(participant) = self.participants.get_mut(&participant_id) {
            participant.producers.push(descriptor.id.clone());
        }

        Ok(descriptor)
    }

    async fn consume(
        &mut self,
        participant_id: ParticipantId,
        producer_id: ProducerId,
        rtp_capabilities: serde_json::Value,
    ) -> Result<ConsumerDescriptor, MeetingError> {
        let producer = self
            .producers
            .get(&producer_id)
            .ok_or_else(|| MeetingError::ProducerNotFound(producer_id.clone()))?;
        if producer.owner == participant_id {
            return Err(MeetingError::SelfConsumptionRejected);
        }
        let kind = producer.kind;

        let transport_id = self
            .participants
            .get(&participant_id)
            .ok_or_else(|| MeetingError::ParticipantNotFound(participant_id.clone()))?
            .transports
            .recv
            .clone()
            .ok_or_else(|| {
                MeetingError::Media(crate::error::RouterError::Transport(
                    "recv transport not created yet".into(),
                ))
            })?;

        let router = self
            .topology
            .router()
            .ok_or(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable))?;
        let preferred_layers = PreferredLayers::default();
        let descriptor = router
            .consume(&transport_id, &producer_id, rtp_capabilities, preferred_layers)
            .await?;

        let consumer = Consumer {
            id: descriptor.id.clone(),
            owner: participant_id.clone(),
            producer_id: producer_id.clone(),
            kind,
            preferred_layers,
            paused: false,
            priority: 1,
        };
        self.consumers.insert(consumer.id.clone(), consumer);

        if let Some(participant) = self.participants.get_mut(&participant_id) {
            participant.consumers.push(descriptor.id.clone());
        }

        Ok(descriptor)
    }

    async fn set_preferred_layers(
        &mut self,
        consumer_id: ConsumerId,
        layers: PreferredLayers,
    ) -> Result<(), MeetingError> {
        let router = self
            .topology
            .router()
            .ok_or(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable))?;
        router.set_preferred_layers(&consumer_id, layers).await?;
        if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
            consumer.preferred_layers = layers;
        }
        Ok(())
    }

    async fn pause_producer(&mut self, producer_id: ProducerId) -> Result<(), MeetingError> {
        let router = self
            .topology
            .router()
            .ok_or(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable))?;
        router.pause_producer(&producer_id).await?;
        if let Some(producer) = self.producers.get_mut(&producer_id) {
            producer.paused = true;
        }
        Ok(())
    }

    async fn resume_producer(&mut self, producer_id: ProducerId) -> Result<(), MeetingError> {
        let router = self
            .topology
            .router()
            .ok_or(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable))?;
        router.resume_producer(&producer_id).await?;
        if let Some(producer) = self.producers.get_mut(&producer_id) {
            producer.paused = false;
        }
        Ok(())
    }

    async fn pause_consumer(&mut self, consumer_id: ConsumerId) -> Result<(), MeetingError> {
        let router = self
            .topology
            .router()
            .ok_or(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable))?;
        router.pause_consumer(&consumer_id).await?;
        if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
            consumer.paused = true;
        }
        Ok(())
    }

    async fn resume_consumer(&mut self, consumer_id: ConsumerId) -> Result<(), MeetingError> {
        let router = self
            .topology
            .router()
            .ok_or(MeetingError::Media(crate::error::RouterError::NoWorkersAvailable))?;
        router.resume_consumer(&consumer_id).await?;
        if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
            consumer.paused = false;
        }
        Ok(())
    }

    /// Chooses the meeting's starting mode from `options.max_participants`
    /// (§4.1: mesh if at or below `p2p_threshold`, sfu otherwise) before the
    /// quality-check ticker ever runs. A router created here goes straight
    /// into `Sfu`, not `Transitioning` — there is no prior mode for anyone
    /// to ack out of. Falls back to mesh if router creation fails; the
    /// regular upgrade path will retry once participants accumulate.
    async fn initialize_topology(&mut self) {
        if self.options.max_participants <= self.settings.p2p_threshold {
            return;
        }

        match self.media_factory.create_router(&self.id).await {
            Ok(router) => {
                self.topology = TopologyState::Sfu { router: Arc::from(router) };
                info!("meeting starting directly in sfu mode per configured capacity");
            }
            Err(err) => {
                warn!(error = %err, "failed to create router for initial sfu mode; starting in mesh");
            }
        }
    }

    /// Rebuilds the router if it was backed by the worker that just died
    /// (§4.7). Mid-transition routers are left alone; the in-flight
    /// migration will surface its own error if the new router is unusable
    /// and the next quality tick can retry.
    async fn reconcile_router(&mut self, dead_worker_tag: String) {
        let TopologyState::Sfu { router } = &self.topology else {
            return;
        };
        if router.worker_tag().as_deref() != Some(dead_worker_tag.as_str()) {
            return;
        }

        warn!(meeting_id = %self.id, "router's worker died; reallocating");
        match self.media_factory.create_router(&self.id).await {
            Ok(new_router) => {
                self.topology = TopologyState::Sfu {
                    router: Arc::from(new_router),
                };
                info!(meeting_id = %self.id, "router reallocated after worker loss");
            }
            Err(err) => {
                warn!(meeting_id = %self.id, error = %err, "failed to reallocate router after worker loss");
            }
        }
    }

    fn snapshot(&self) -> MeetingSnapshot {
        MeetingSnapshot {
            id: self.id.clone(),
            created_at: self.created_at,
            host_id: self.host_id.clone(),
            options: self.options.clone(),
            mode: self.topology.mode(),
            participant_ids: self.participants.keys().cloned().collect(),
            transition_history: self.transition_history.clone(),
            last_transition_time: self.last_transition_time,
        }
    }

    /// Runs the hysteresis policy and, when a transition is warranted and
    /// none is already in flight, starts the migration protocol (§4.2).
    async fn evaluate_topology(&mut self) {
        if matches!(self.topology, TopologyState::Transitioning { .. }) {
            self.check_transition_timeout();
            return;
        }

        let policy = HysteresisPolicy::new(&self.settings);
        let now = Utc::now();
        let count = self.participants.len() as u32;
        let windows: Vec<_> = self.participants.values().map(|p| &p.quality).collect();

        let decision = match self.topology.mode() {
            TopologyModeTag::Mesh => {
                policy.should_upgrade(count, &windows, self.last_transition_time, now)
            }
            TopologyModeTag::Sfu => {
                policy.should_downgrade(count, &windows, self.last_transition_time, now)
            }
            TopologyModeTag::Transitioning => None,
        };

        if let Some(reason) = decision {
            let target = match self.topology.mode() {
                TopologyModeTag::Mesh => TopologyModeTag::Sfu,
                TopologyModeTag::Sfu => TopologyModeTag::Mesh,
                TopologyModeTag::Transitioning => return,
            };
            self.start_transition(target, reason, now).await;
        }
    }

    async fn start_transition(
        &mut self,
        target: TopologyModeTag,
        reason: crate::model::TransitionReason,
        now: chrono::DateTime<Utc>,
    ) {
        let from = self.topology.mode();
        let router = if target == TopologyModeTag::Sfu {
            match self.media_factory.create_router(&self.id).await {
                Ok(router) => Some(Arc::from(router)),
                Err(err) => {
                    warn!(error = %err, "failed to create router for transition");
                    return;
                }
            }
        } else {
            None
        };

        self.topology = TopologyState::Transitioning {
            target,
            router,
            started_at: now,
            deadline_ms: self.settings.transition_timeout_ms,
            acked: Default::default(),
        };

        let _ = self.events.transitions.send(TransitionEvent::Started {
            from,
            to: target,
            reason,
            deadline_ms: self.settings.transition_timeout_ms,
        });
    }

    /// A participant that never acks within the deadline is migrated
    /// anyway (§4.2: the meeting does not block forever on one peer); the
    /// transition always completes once the deadline passes.
    fn check_transition_timeout(&mut self) {
        let should_complete = match &self.topology {
            TopologyState::Transitioning {
                started_at,
                deadline_ms,
                ..
            } => {
                let elapsed = (Utc::now() - *started_at).num_milliseconds().max(0) as u64;
                elapsed >= *deadline_ms
            }
            _ => false,
        };

        if should_complete {
            self.complete_transition();
        }
    }

    fn complete_transition(&mut self) {
        let (target, router) = match std::mem::replace(&mut self.topology, TopologyState::Mesh) {
            TopologyState::Transitioning { target, router, .. } => (target, router),
            other => {
                self.topology = other;
                return;
            }
        };

        self.topology = match (target, router) {
            (TopologyModeTag::Sfu, Some(router)) => TopologyState::Sfu { router },
            _ => TopologyState::Mesh,
        };

        self.last_transition_time = Some(Utc::now());
        self.transition_history.push(TransitionRecord {
            from_mode: if target == TopologyModeTag::Sfu {
                TopologyModeTag::Mesh
            } else {
                TopologyModeTag::Sfu
            },
            to_mode: target,
            timestamp: Utc::now(),
            reason: crate::model::TransitionReason::Capacity,
        });

        let _ = self
            .events
            .transitions
            .send(TransitionEvent::Completed { mode: target });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_backend::fake::FakeMediaBackendFactory;

    fn settings(sfu_threshold: u32, quality_check_interval_ms: u64) -> TopologySettings {
        TopologySettings {
            p2p_threshold: 1,
            sfu_threshold,
            transition_timeout_ms: 2000,
            min_time_between_transitions_ms: 0,
            quality_check_interval_ms,
            poor_quality_packet_loss_pct: 5.0,
            poor_quality_rtt_ms: 200,
            ghost_grace_ms: 15_000,
            heartbeat_interval_ms: 30_000,
            prewarm_idle_timeout_ms: 60_000,
        }
    }

    fn spawn_meeting(sfu_threshold: u32, quality_check_interval_ms: u64) -> MeetingHandle {
        MeetingActor::spawn(
            MeetingId::from("meeting-1"),
            ParticipantId::from("host"),
            Some("Host".to_string()),
            MeetingOptions {
                max_participants: 8,
                ..MeetingOptions::default()
            },
            Arc::new(FakeMediaBackendFactory),
            settings(sfu_threshold, quality_check_interval_ms),
        )
    }

    #[tokio::test]
    async fn initial_mode_follows_configured_capacity() {
        let roomy = MeetingActor::spawn(
            MeetingId::from("big-meeting"),
            ParticipantId::from("host"),
            None,
            MeetingOptions {
                max_participants: 8,
                ..MeetingOptions::default()
            },
            Arc::new(FakeMediaBackendFactory),
            settings(4, 60_000),
        );
        assert_eq!(roomy.snapshot().await.unwrap().mode, TopologyModeTag::Sfu);

        let tiny = MeetingActor::spawn(
            MeetingId::from("small-meeting"),
            ParticipantId::from("host"),
            None,
            MeetingOptions {
                max_participants: 1,
                ..MeetingOptions::default()
            },
            Arc::new(FakeMediaBackendFactory),
            settings(4, 60_000),
        );
        assert_eq!(tiny.snapshot().await.unwrap().mode, TopologyModeTag::Mesh);
    }

    #[tokio::test]
    async fn join_rejects_duplicate_and_enforces_capacity() {
        let handle = spawn_meeting(100, 60_000);

        assert!(matches!(
            handle.join(ParticipantId::from("host"), None, false).await,
            Err(MeetingError::ParticipantAlreadyJoined(_))
        ));

        for i in 0..7 {
            handle
                .join(ParticipantId::from(format!("p{i}")), None, false)
                .await
                .expect("room has capacity");
        }

        assert!(matches!(
            handle.join(ParticipantId::from("overflow"), None, false).await,
            Err(MeetingError::MeetingFull { .. })
        ));
    }

    #[tokio::test]
    async fn leave_transfers_host_to_remaining_participant() {
        let handle = spawn_meeting(100, 60_000);
        handle
            .join(ParticipantId::from("alice"), None, false)
            .await
            .unwrap();

        handle.leave(ParticipantId::from("host")).await.unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.host_id, ParticipantId::from("alice"));
        assert_eq!(snapshot.participant_ids.len(), 1);
    }

    #[tokio::test]
    async fn produce_and_consume_rejects_self_consumption() {
        // max_participants (8) exceeds p2p_threshold (1), so the meeting
        // starts directly in sfu mode and the router is available right
        // away for transport and media operations in this test.
        let handle = spawn_meeting(2, 10);
        handle
            .join(ParticipantId::from("alice"), None, false)
            .await
            .unwrap();

        let send_transport = handle
            .create_transport(ParticipantId::from("host"))
            .await
            .expect("router should be available once in/transitioning to sfu mode");

        let producer = handle
            .produce(
                ParticipantId::from("host"),
                send_transport.id.clone(),
                ProducerKind::Video,
                SourceTag::Camera,
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let self_consume = handle
            .consume(
                ParticipantId::from("host"),
                producer.id.clone(),
                serde_json::json!({}),
            )
            .await;
        assert!(matches!(
            self_consume,
            Err(MeetingError::SelfConsumptionRejected)
        ));

        // First call becomes alice's send transport, second becomes recv —
        // consuming requires the recv transport to already exist.
        handle
            .create_transport(ParticipantId::from("alice"))
            .await
            .unwrap();
        handle
            .create_transport(ParticipantId::from("alice"))
            .await
            .unwrap();

        let consumer = handle
            .consume(
                ParticipantId::from("alice"),
                producer.id.clone(),
                serde_json::json!({}),
            )
            .await
            .expect("alice may consume host's producer");
        assert_eq!(consumer.producer_id, producer.id);

        let others = handle.list_other_producers(ParticipantId::from("alice")).await;
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].1, producer.id);
    }
}
