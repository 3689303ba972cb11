//! Machinery shared by the consumer and provider managers: the locked
//! read-modify-write around one negotiation, the inbound hash guard, and the
//! outbound dispatch pass.

use std::sync::Arc;

use connector_core::{
    retry_due, ClaimToken, ContractNegotiation, MessageOutcome, NegotiationRole, NegotiationState,
    ProcessSummary,
};
use connector_storage::{ConnectorStorage, NegotiationRecord, StorageError};

use super::message::{
    MessageHeader, NegotiationMessage, NegotiationResponse, ProtocolMessage, ResponseStatus,
};
use super::transport::DispatcherRegistry;
use super::{NegotiationListener, OfferDecisionPolicy};
use crate::config::NegotiationConfig;
use crate::error::NegotiationError;
use crate::validation::ContractValidationService;

/// Whether a closure run under the row lock wants its changes kept.
pub(crate) enum Mutation<R> {
    Commit(R),
    Discard(R),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Confirmed,
    Declined,
    Failed,
}

/// A committed terminal transition, delivered to listeners after commit.
pub(crate) struct Notice {
    event: Event,
    negotiation: ContractNegotiation,
}

impl Notice {
    fn new(event: Event, negotiation: &ContractNegotiation) -> Self {
        Self {
            event,
            negotiation: negotiation.clone(),
        }
    }
}

/// What a role-specific handler made of an inbound message that passed the
/// hash guard.
pub(crate) enum Step {
    /// State changed; record the message as applied.
    Applied(Option<Event>),
    /// Content failed validation; the negotiation moves to `Error`.
    Rejected(String),
    /// The current state does not accept the message; nothing changes.
    Refused(String),
}

/// The message a pending negotiation sends, and the state it moves to once
/// the counter-party acknowledges it.
pub(crate) struct Outbound {
    pub payload: NegotiationMessage,
    pub next: NegotiationState,
}

pub(crate) type OutboundFn = fn(&ContractNegotiation) -> Result<Outbound, String>;

enum Delivery {
    Acknowledged(NegotiationResponse),
    Retry(String),
    Fail(String),
}

enum Dispatched {
    Done,
    Retrying,
    Skipped,
}

type Handled = (NegotiationResponse, Option<Notice>);

pub(crate) struct ManagerCore<S> {
    pub storage: Arc<S>,
    pub validation: Arc<ContractValidationService>,
    pub dispatchers: Arc<DispatcherRegistry>,
    pub decisions: Arc<dyn OfferDecisionPolicy>,
    pub listeners: Vec<Arc<dyn NegotiationListener>>,
    pub config: NegotiationConfig,
    pub role: NegotiationRole,
}

impl<S: ConnectorStorage> ManagerCore<S> {
    // ── Transactions ─────────────────────────────────────────────────

    /// Lock the negotiation, run `f` on it, and commit or abort as `f` asks.
    ///
    /// `f` also receives the version the row was read at. Returns `None` if
    /// no such negotiation exists.
    pub async fn with_negotiation<R, F>(
        &self,
        id: &str,
        f: F,
    ) -> Result<Option<R>, NegotiationError>
    where
        F: FnOnce(&mut ContractNegotiation, i64) -> Result<Mutation<R>, NegotiationError> + Send,
        R: Send,
    {
        let storage = self.storage.as_ref();
        let mut snapshot = storage.begin_snapshot().await?;
        let record = match storage.get_negotiation_for_update(&mut snapshot, id).await {
            Ok(record) => record,
            Err(StorageError::NotFound { .. }) => {
                storage.abort_snapshot(snapshot).await?;
                return Ok(None);
            }
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
        };

        let NegotiationRecord {
            mut negotiation,
            version,
            ..
        } = record;
        let mutation = match f(&mut negotiation, version) {
            Ok(mutation) => mutation,
            Err(e) => {
                let _ = storage.abort_snapshot(snapshot).await;
                return Err(e);
            }
        };

        match mutation {
            Mutation::Discard(result) => {
                storage.abort_snapshot(snapshot).await?;
                Ok(Some(result))
            }
            Mutation::Commit(result) => {
                if let Err(e) = storage
                    .update_negotiation(&mut snapshot, version, negotiation)
                    .await
                {
                    let _ = storage.abort_snapshot(snapshot).await;
                    return Err(e.into());
                }
                storage.commit_snapshot(snapshot).await?;
                Ok(Some(result))
            }
        }
    }

    /// Store a new negotiation. Fails with `AlreadyExists` if the id is taken.
    pub async fn insert(&self, negotiation: ContractNegotiation) -> Result<(), StorageError> {
        let storage = self.storage.as_ref();
        let mut snapshot = storage.begin_snapshot().await?;
        if let Err(e) = storage.create_negotiation(&mut snapshot, negotiation).await {
            let _ = storage.abort_snapshot(snapshot).await;
            return Err(e);
        }
        storage.commit_snapshot(snapshot).await
    }

    // ── Inbound ──────────────────────────────────────────────────────

    /// Apply an inbound message to an existing negotiation.
    ///
    /// In order: a redelivered message gets its recorded outcome back; a
    /// terminal negotiation refuses everything; a stale hash is a conflict;
    /// only then does `apply` see the negotiation.
    pub async fn receive<F>(
        &self,
        id: &str,
        header: &MessageHeader,
        key: String,
        apply: F,
    ) -> Result<NegotiationResponse, NegotiationError>
    where
        F: FnOnce(&mut ContractNegotiation) -> Result<Step, NegotiationError> + Send,
    {
        let role = self.role;
        let handled = self
            .with_negotiation(id, |n, _| {
                if n.role() != role {
                    return Ok(Mutation::Discard((
                        NegotiationResponse::fatal(n.id(), "unknown negotiation"),
                        None,
                    )));
                }
                if let Some(response) = guard(n, &key, header) {
                    return Ok(Mutation::Discard((response, None)));
                }
                let step = apply(n)?;
                settle(n, step, key, header)
            })
            .await?;

        match handled {
            None => Ok(NegotiationResponse::fatal(id, "unknown negotiation")),
            Some((response, notice)) => {
                self.notify(notice).await;
                Ok(response)
            }
        }
    }

    /// Apply an inbound message that opens a new negotiation and store the
    /// result. Returns `None` if a negotiation with the same id already
    /// exists, leaving the caller to treat the message as one for it.
    pub async fn receive_new<F>(
        &self,
        mut negotiation: ContractNegotiation,
        header: &MessageHeader,
        key: String,
        apply: F,
    ) -> Result<Option<NegotiationResponse>, NegotiationError>
    where
        F: FnOnce(&mut ContractNegotiation) -> Result<Step, NegotiationError> + Send,
    {
        let step = apply(&mut negotiation)?;
        let (response, notice) = match settle(&mut negotiation, step, key, header)? {
            Mutation::Discard((response, _)) => return Ok(Some(response)),
            Mutation::Commit(handled) => handled,
        };
        match self.insert(negotiation).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.notify(notice).await;
        Ok(Some(response))
    }

    /// Run a local operation on a negotiation of this manager's role. `f`
    /// returns a refusal reason to leave the negotiation untouched.
    pub async fn command<F>(&self, id: &str, f: F) -> Result<NegotiationResponse, NegotiationError>
    where
        F: FnOnce(&mut ContractNegotiation) -> Result<Option<String>, NegotiationError> + Send,
    {
        let role = self.role;
        let response = self
            .with_negotiation(id, |n, _| {
                if n.role() != role {
                    return Ok(Mutation::Discard(NegotiationResponse::fatal(
                        n.id(),
                        "unknown negotiation",
                    )));
                }
                if n.state().is_terminal() {
                    let detail = format!("negotiation is {:?}", n.state());
                    return Ok(Mutation::Discard(NegotiationResponse::fatal(n.id(), detail)));
                }
                match f(n)? {
                    None => Ok(Mutation::Commit(NegotiationResponse::ok(n.id()))),
                    Some(reason) => Ok(Mutation::Discard(NegotiationResponse::fatal(n.id(), reason))),
                }
            })
            .await?;
        Ok(response.unwrap_or_else(|| NegotiationResponse::fatal(id, "unknown negotiation")))
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// One dispatch pass: at most one send per pending negotiation of this
    /// role, up to `batch_size` per pending state.
    ///
    /// A negotiation whose last send failed is skipped until its own
    /// backoff, `retry_base_millis` doubled per failure, has elapsed.
    pub async fn process_pending(&self, outbound: OutboundFn) -> ProcessSummary {
        let mut summary = ProcessSummary::default();
        let base_millis = self.config.retry_base_millis;
        let now = connector_core::now_millis();
        for state in NegotiationState::PENDING {
            let records = match self.storage.list_negotiations(Some(state), 0).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::error!(role = ?self.role, state = ?state, error = %e, "failed to list pending negotiations");
                    summary.failed += 1;
                    continue;
                }
            };
            let batch = records
                .into_iter()
                .filter(|r| r.negotiation.role() == self.role)
                .filter(|r| {
                    let n = &r.negotiation;
                    retry_due(n.state_timestamp(), n.retry_count(), base_millis, now)
                })
                .take(self.config.batch_size);
            for record in batch {
                let id = record.negotiation.id().to_string();
                match self.dispatch(record, outbound).await {
                    Ok(Dispatched::Done) => summary.processed += 1,
                    Ok(Dispatched::Retrying) => summary.failed += 1,
                    Ok(Dispatched::Skipped) => {}
                    Err(e) => {
                        tracing::error!(negotiation = %id, error = %e, "dispatch failed");
                        summary.failed += 1;
                    }
                }
            }
        }
        summary
    }

    /// Send the pending message of one negotiation, then record the result.
    ///
    /// The row is not locked while the message is in flight. The result is
    /// only recorded if the row is still at the version it was read at;
    /// otherwise something else moved the negotiation and the next pass
    /// looks at it again.
    async fn dispatch(
        &self,
        record: NegotiationRecord,
        outbound: OutboundFn,
    ) -> Result<Dispatched, NegotiationError> {
        let read_version = record.version;
        let negotiation = record.negotiation;
        let id = negotiation.id().to_string();

        let (delivery, next) = match outbound(&negotiation)
            .and_then(|o| self.message_for(&negotiation, o))
        {
            Ok((message, next)) => (self.deliver(message).await, next),
            Err(reason) => (Delivery::Fail(reason), negotiation.state()),
        };

        let max_retries = self.config.max_retries;
        let result = self
            .with_negotiation(&id, move |n, version| {
                if version != read_version {
                    tracing::debug!(negotiation = %n.id(), "negotiation changed during send; result dropped");
                    return Ok(Mutation::Discard((Dispatched::Skipped, None)));
                }
                match delivery {
                    Delivery::Acknowledged(response) => {
                        n.correlate(&response.negotiation_id);
                        n.transition_to(next)?;
                        tracing::info!(negotiation = %n.id(), state = ?next, "message acknowledged");
                        let notice = match next {
                            NegotiationState::Confirmed => Some(Notice::new(Event::Confirmed, n)),
                            NegotiationState::Declined => Some(Notice::new(Event::Declined, n)),
                            _ => None,
                        };
                        Ok(Mutation::Commit((Dispatched::Done, notice)))
                    }
                    Delivery::Retry(detail) => {
                        let attempts = n.record_retry();
                        if attempts > max_retries {
                            tracing::error!(negotiation = %n.id(), attempts, detail = %detail, "giving up on negotiation");
                            n.transition_error(format!("gave up after {attempts} attempts: {detail}"))?;
                            return Ok(Mutation::Commit((
                                Dispatched::Done,
                                Some(Notice::new(Event::Failed, n)),
                            )));
                        }
                        tracing::warn!(negotiation = %n.id(), attempts, detail = %detail, "send failed; will retry");
                        Ok(Mutation::Commit((Dispatched::Retrying, None)))
                    }
                    Delivery::Fail(detail) => {
                        tracing::error!(negotiation = %n.id(), detail = %detail, "negotiation failed");
                        n.transition_error(detail)?;
                        Ok(Mutation::Commit((
                            Dispatched::Done,
                            Some(Notice::new(Event::Failed, n)),
                        )))
                    }
                }
            })
            .await?;

        match result {
            Some((dispatched, notice)) => {
                self.notify(notice).await;
                Ok(dispatched)
            }
            None => Ok(Dispatched::Skipped),
        }
    }

    fn message_for(
        &self,
        negotiation: &ContractNegotiation,
        outbound: Outbound,
    ) -> Result<(ProtocolMessage, NegotiationState), String> {
        let mut after = negotiation.clone();
        after.transition_to(outbound.next).map_err(|e| e.to_string())?;
        let counter_party = negotiation.counter_party();
        let message = ProtocolMessage {
            header: MessageHeader {
                counter_party_address: counter_party.address.clone(),
                callback_address: self.config.callback_address.clone(),
                connector_id: self.config.connector_id.clone(),
                protocol: counter_party.protocol.clone(),
                sender_role: self.role,
                correlation_id: negotiation.id().to_string(),
                negotiation_id: negotiation.correlation_id().map(str::to_string),
                hash: negotiation.counter_party_hash().map(str::to_string),
                sender_hash: after.hash().to_string(),
            },
            payload: outbound.payload,
        };
        Ok((message, outbound.next))
    }

    async fn deliver(&self, message: ProtocolMessage) -> Delivery {
        match self.dispatchers.send(message).await {
            Ok(response) => match response.status {
                ResponseStatus::Ok => Delivery::Acknowledged(response),
                ResponseStatus::Conflict => Delivery::Retry(detail_of(&response)),
                ResponseStatus::Rejected | ResponseStatus::FatalError => {
                    Delivery::Fail(format!("counter-party answered {:?}: {}", response.status, detail_of(&response)))
                }
            },
            Err(e) if e.is_retryable() => Delivery::Retry(e.to_string()),
            Err(e) => Delivery::Fail(e.to_string()),
        }
    }

    // ── Listeners ────────────────────────────────────────────────────

    async fn notify(&self, notice: Option<Notice>) {
        let Some(Notice { event, negotiation }) = notice else {
            return;
        };
        tracing::info!(
            negotiation = %negotiation.id(),
            role = ?negotiation.role(),
            event = ?event,
            "negotiation reached terminal state"
        );
        for listener in &self.listeners {
            match event {
                Event::Confirmed => listener.confirmed(&negotiation).await,
                Event::Declined => listener.declined(&negotiation).await,
                Event::Failed => listener.failed(&negotiation).await,
            }
        }
    }
}

pub(crate) fn missing_id() -> NegotiationResponse {
    NegotiationResponse::fatal("", "message does not name a negotiation")
}

fn detail_of(response: &NegotiationResponse) -> String {
    response.detail.clone().unwrap_or_default()
}

/// Checks every inbound message passes before role-specific handling.
fn guard(negotiation: &ContractNegotiation, key: &str, header: &MessageHeader) -> Option<NegotiationResponse> {
    if let Some(outcome) = negotiation.processed_outcome(key) {
        tracing::debug!(negotiation = %negotiation.id(), "redelivered message; returning recorded outcome");
        return Some(match outcome {
            MessageOutcome::Applied => NegotiationResponse::ok(negotiation.id()),
            MessageOutcome::Rejected { reason } => {
                NegotiationResponse::rejected(negotiation.id(), reason.clone())
            }
        });
    }
    if negotiation.state().is_terminal() {
        return Some(NegotiationResponse::fatal(
            negotiation.id(),
            format!("negotiation is {:?}", negotiation.state()),
        ));
    }
    if header.hash.as_deref() != Some(negotiation.hash()) {
        tracing::debug!(negotiation = %negotiation.id(), "stale negotiation hash");
        return Some(NegotiationResponse::conflict(
            negotiation.id(),
            "negotiation hash does not match",
        ));
    }
    None
}

fn settle(
    negotiation: &mut ContractNegotiation,
    step: Step,
    key: String,
    header: &MessageHeader,
) -> Result<Mutation<Handled>, NegotiationError> {
    match step {
        Step::Refused(reason) => {
            tracing::debug!(negotiation = %negotiation.id(), state = ?negotiation.state(), reason = %reason, "message refused");
            Ok(Mutation::Discard((
                NegotiationResponse::fatal(negotiation.id(), reason),
                None,
            )))
        }
        Step::Applied(event) => {
            negotiation.record_processed(key, MessageOutcome::Applied);
            acknowledge(negotiation, header);
            let notice = event.map(|e| Notice::new(e, negotiation));
            Ok(Mutation::Commit((NegotiationResponse::ok(negotiation.id()), notice)))
        }
        Step::Rejected(reason) => {
            tracing::info!(negotiation = %negotiation.id(), reason = %reason, "message rejected");
            negotiation.transition_error(reason.clone())?;
            negotiation.record_processed(
                key,
                MessageOutcome::Rejected {
                    reason: reason.clone(),
                },
            );
            acknowledge(negotiation, header);
            let notice = Some(Notice::new(Event::Failed, negotiation));
            Ok(Mutation::Commit((
                NegotiationResponse::rejected(negotiation.id(), reason),
                notice,
            )))
        }
    }
}

fn acknowledge(negotiation: &mut ContractNegotiation, header: &MessageHeader) {
    negotiation.correlate(&header.correlation_id);
    negotiation.set_counter_party_hash(header.sender_hash.clone());
}

/// Accepts a message only in the listed states.
pub(crate) fn expect_state(
    negotiation: &ContractNegotiation,
    allowed: &[NegotiationState],
    message: &str,
) -> Option<Step> {
    if allowed.contains(&negotiation.state()) {
        return None;
    }
    Some(Step::Refused(format!(
        "{message} not accepted in state {:?}",
        negotiation.state()
    )))
}

/// The counter-party walked away. Only the counter-party itself may say so.
pub(crate) fn counter_party_declined(
    validation: &ContractValidationService,
    token: &ClaimToken,
    negotiation: &mut ContractNegotiation,
    reason: String,
) -> Result<Step, NegotiationError> {
    if !validation.validate_sender(token, &negotiation.counter_party().id) {
        return Ok(Step::Refused("decline not sent by the counter-party".to_string()));
    }
    negotiation.declined_by_counter_party(reason)?;
    Ok(Step::Applied(Some(Event::Declined)))
}

/// Local decline, from any state that can still be declined.
pub(crate) fn decline_locally(
    negotiation: &mut ContractNegotiation,
    reason: String,
) -> Result<Option<String>, NegotiationError> {
    if !negotiation
        .state()
        .can_transition_to(NegotiationState::Declining)
    {
        return Ok(Some(format!(
            "cannot decline in state {:?}",
            negotiation.state()
        )));
    }
    negotiation.decline(reason)?;
    Ok(None)
}
