//! The compiled, runnable form of a flow definition.

use super::{AdvanceOutcome, CompletionHandler, ErrorHandler, FlowServices, TraceStatus};
use crate::config::LockLostPolicy;
use crate::core::{BatchKey, FlowContext, FlowData, FlowStatus};
use crate::errors::{DefinitionError, DefinitionErrorInfo, FlowError, FlowResult, JoberError};
use crate::events::{
    LOCK_LOST, RETRY_SCHEDULED, TRACE_ADVANCED, TRACE_ARCHIVED, TRACE_FAILED, TRACE_PAUSED,
};
use crate::graph::{FlowDefinition, FlowNode, NodeKind};
use crate::jober::{Jober, JoberOutput, JoberSlot};
use crate::lock::LockToken;
use crate::observability::batch_span;
use crate::persistence::RetryRecord;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// What one locked pass over a batch key produced.
#[derive(Debug)]
struct Step {
    outcome: AdvanceOutcome,
    next: Vec<BatchKey>,
}

impl Step {
    fn done(outcome: AdvanceOutcome) -> Self {
        Self {
            outcome,
            next: Vec::new(),
        }
    }
}

/// A flow definition bound to its executors and services.
///
/// Every mutation of the contexts under a [`BatchKey`] happens while holding
/// that key's lock. Successor contexts are persisted before their origin is
/// archived, and every write reports how many rows it touched so a short
/// write surfaces as [`FlowError::PersistenceInconsistency`].
pub struct FlowPipeline<T: FlowData> {
    definition: Arc<FlowDefinition>,
    jobers: HashMap<String, JoberSlot<T>>,
    completion: Vec<CompletionHandler<T>>,
    error_handlers: Vec<ErrorHandler<T>>,
    services: FlowServices<T>,
}

impl<T: FlowData> FlowPipeline<T> {
    pub(crate) fn new(
        definition: Arc<FlowDefinition>,
        jobers: HashMap<String, JoberSlot<T>>,
        completion: Vec<CompletionHandler<T>>,
        error_handlers: Vec<ErrorHandler<T>>,
        services: FlowServices<T>,
    ) -> Self {
        let stream_id = definition.stream_id().to_string();
        let events = services.events.clone();
        services.locks.subscribe(Arc::new(move |key: &BatchKey, reason: &str| {
            if key.stream_id != stream_id {
                return;
            }
            warn!(
                stream_id = %key.stream_id,
                position = %key.position,
                to_batch = ?key.to_batch,
                reason,
                "Position lock lost while held"
            );
            events.try_emit(
                LOCK_LOST,
                Some(json!({
                    "stream_id": key.stream_id,
                    "position": key.position,
                    "to_batch": key.to_batch,
                    "reason": reason,
                })),
            );
        }));

        Self {
            definition,
            jobers,
            completion,
            error_handlers,
            services,
        }
    }

    /// Returns the compiled definition.
    #[must_use]
    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    /// Returns the stream id contexts of this pipeline carry.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        self.definition.stream_id()
    }

    /// Returns the services the pipeline runs against.
    #[must_use]
    pub fn services(&self) -> &FlowServices<T> {
        &self.services
    }

    /// Returns the jober currently bound to a state node.
    #[must_use]
    pub fn jober(&self, node: &str) -> Option<Arc<dyn Jober<T>>> {
        self.jobers.get(node).map(JoberSlot::load)
    }

    /// Replaces the jober of a state node while the pipeline runs.
    ///
    /// Batches already executing finish with the jober they loaded.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Definition`] if `node` is not a state node.
    pub fn swap_jober(
        &self,
        node: &str,
        jober: Arc<dyn Jober<T>>,
    ) -> FlowResult<Arc<dyn Jober<T>>> {
        let Some(slot) = self.jobers.get(node) else {
            let message = format!("Node '{node}' has no jober to replace");
            return Err(DefinitionError::new(message.clone())
                .with_nodes(vec![node.to_string()])
                .with_error_info(DefinitionErrorInfo::new("FLOW-DEF-JOBER_NOT_STATE", message))
                .into());
        };
        let name = jober.name().to_string();
        let previous = slot.swap(jober);
        info!(
            stream_id = %self.stream_id(),
            position = node,
            jober = %name,
            previous = %previous.name(),
            version = slot.version(),
            "Jober swapped"
        );
        Ok(previous)
    }

    /// Starts a new trace with `payloads` and pushes it as far as it goes.
    ///
    /// All payloads enter the start node as one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting or advancing the contexts fails.
    pub async fn offer(&self, payloads: Vec<T>) -> FlowResult<Uuid> {
        let trace_id = Uuid::new_v4();
        self.offer_to_trace(trace_id, payloads).await?;
        Ok(trace_id)
    }

    /// Like [`FlowPipeline::offer`] but joining an existing trace.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting or advancing the contexts fails.
    pub async fn offer_to_trace(&self, trace_id: Uuid, payloads: Vec<T>) -> FlowResult<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let batch = Uuid::new_v4();
        let start = self.definition.start_node();
        let contexts: Vec<_> = payloads
            .into_iter()
            .map(|data| {
                FlowContext::new(self.stream_id(), trace_id, start.id.clone(), data)
                    .with_batch(batch)
            })
            .collect();

        let saved = self.services.contexts.save(&contexts).await?;
        FlowError::check_affected("offer", contexts.len(), saved)?;
        info!(
            stream_id = %self.stream_id(),
            trace_id = %trace_id,
            position = %start.id,
            to_batch = %batch,
            count = contexts.len(),
            "Offered contexts"
        );

        self.drive(vec![BatchKey::new(self.stream_id(), start.id.clone(), Some(batch))])
            .await
    }

    /// Makes one attempt to advance the pending contexts under
    /// `(position, to_batch)` without waiting for the lock.
    ///
    /// Work emitted downstream is driven to completion before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if `position` is unknown or a store operation fails.
    pub async fn advance(
        &self,
        position: &str,
        to_batch: Option<Uuid>,
    ) -> FlowResult<AdvanceOutcome> {
        self.node(position)?;
        let key = BatchKey::new(self.stream_id(), position, to_batch);
        let step = self.step(key, Duration::ZERO).await?;
        self.drive(step.next).await?;
        Ok(step.outcome)
    }

    /// Resumes parked contexts, merging `merge` into each.
    ///
    /// Contexts parked at a gate are PENDING, contexts parked behind an
    /// async jober are PROCESSING. Each resumed context gets a fresh batch
    /// and moves to its node's successor.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::ContextNotFound`] for unknown ids,
    /// [`FlowError::AlreadyResumed`] if a context was resumed before,
    /// [`FlowError::NotParked`] if it is not waiting for a resume, and
    /// [`FlowError::LockDenied`] if its position stays locked.
    pub async fn resume(&self, ids: &[Uuid], merge: T) -> FlowResult<()> {
        let found = self.services.contexts.find_by_ids(ids).await?;
        let mut groups: BTreeMap<BatchKey, Vec<Uuid>> = BTreeMap::new();
        for id in ids {
            let ctx = found
                .iter()
                .find(|c| c.id == *id && c.stream_id == self.stream_id())
                .ok_or(FlowError::ContextNotFound(*id))?;
            groups.entry(ctx.batch_key()).or_default().push(*id);
        }

        let wait = self.services.config.lock.wait();
        let mut next = Vec::new();
        let mut outcome = Ok(());
        for (key, group) in groups {
            let Some(token) = self.services.locks.acquire(&key, wait).await? else {
                outcome = Err(FlowError::LockDenied { key: key.to_string() });
                break;
            };
            let result = self.resume_group(&key, &token, &group, &merge).await;
            self.services.locks.release(token).await?;
            match result {
                Ok(keys) => next.extend(keys),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        self.drive(next).await?;
        outcome
    }

    /// Returns RETRYABLE contexts under `key` to PENDING and advances them.
    ///
    /// # Errors
    ///
    /// Returns an error if a store operation fails.
    pub async fn reinject(&self, key: &BatchKey) -> FlowResult<AdvanceOutcome> {
        let wait = self.services.config.lock.wait();
        let Some(token) = self.services.locks.acquire(key, wait).await? else {
            debug!(lock = %key, "Retry skipped, position locked");
            return Ok(AdvanceOutcome::LockDenied);
        };
        let result = self.release_retryable(key, &token).await;
        self.services.locks.release(token).await?;

        if result? == 0 {
            if let Some(batch) = key.to_batch {
                self.services.retries.delete(batch).await?;
            }
            return Ok(AdvanceOutcome::Idle);
        }

        let step = self.step(key.clone(), wait).await?;
        self.drive(step.next).await?;
        Ok(step.outcome)
    }

    /// Summarizes the state of every context in a trace.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::TraceNotFound`] if the trace has no contexts.
    pub async fn trace_status(&self, trace_id: Uuid) -> FlowResult<TraceStatus> {
        let contexts = self.services.contexts.find_all_by_trace(trace_id).await?;
        if contexts.is_empty() {
            return Err(FlowError::TraceNotFound(trace_id));
        }

        let active = |c: &FlowContext<T>| {
            matches!(
                c.status,
                FlowStatus::Pending | FlowStatus::Processing | FlowStatus::Retryable
            )
        };
        if contexts.iter().any(|c| active(c) && !self.is_parked(c)) {
            Ok(TraceStatus::Running)
        } else if contexts.iter().any(|c| self.is_parked(c)) {
            Ok(TraceStatus::Paused)
        } else if contexts.iter().any(|c| c.status == FlowStatus::Error) {
            Ok(TraceStatus::Failed)
        } else {
            Ok(TraceStatus::Archived)
        }
    }

    fn node(&self, position: &str) -> FlowResult<&FlowNode> {
        self.definition.lookup_node(position).ok_or_else(|| {
            let message = format!("Unknown node '{position}' in stream '{}'", self.stream_id());
            DefinitionError::new(message.clone())
                .with_nodes(vec![position.to_string()])
                .with_error_info(DefinitionErrorInfo::new("FLOW-DEF-UNKNOWN_NODE", message))
                .into()
        })
    }

    fn is_async(&self, node: &str) -> bool {
        self.jobers.get(node).is_some_and(|slot| slot.load().is_async())
    }

    fn is_parked(&self, ctx: &FlowContext<T>) -> bool {
        match self.definition.lookup_node(&ctx.position).map(|n| n.kind) {
            Some(NodeKind::Gate) => ctx.status == FlowStatus::Pending,
            Some(NodeKind::State) => {
                ctx.status == FlowStatus::Processing && self.is_async(&ctx.position)
            }
            _ => false,
        }
    }

    /// Runs steps until no more work is emitted.
    ///
    /// A failing step does not cancel its siblings: every in-flight step
    /// runs to its lock release and the first error is returned afterwards.
    async fn drive(&self, keys: Vec<BatchKey>) -> FlowResult<()> {
        let wait = self.services.config.lock.wait();
        let mut in_flight: FuturesUnordered<_> =
            keys.into_iter().map(|key| self.step(key, wait)).collect();
        let mut first_error = None;

        while let Some(result) = in_flight.next().await {
            match result {
                Ok(step) => {
                    for key in step.next {
                        in_flight.push(self.step(key, wait));
                    }
                }
                Err(e) => {
                    error!(stream_id = %self.stream_id(), error = %e, "Pipeline step failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn step(&self, key: BatchKey, wait: Duration) -> FlowResult<Step> {
        let span = batch_span(&key);
        self.locked_step(key, wait).instrument(span).await
    }

    async fn locked_step(&self, key: BatchKey, wait: Duration) -> FlowResult<Step> {
        let Some(token) = self.services.locks.acquire(&key, wait).await? else {
            warn!(
                stream_id = %key.stream_id,
                position = %key.position,
                to_batch = ?key.to_batch,
                "Position locked elsewhere, leaving contexts pending"
            );
            return Ok(Step::done(AdvanceOutcome::LockDenied));
        };

        let mut taken = Vec::new();
        let result = self.process(&key, &token, &mut taken).await;
        self.services.locks.release(token).await?;

        let requeue = self.services.config.lock.lost_policy == LockLostPolicy::Requeue;
        let mut step = match result {
            Err(FlowError::LockLost { .. }) if requeue && !taken.is_empty() => {
                return self.requeue(&key, &taken).await;
            }
            other => other?,
        };
        if self.arrived_while_held(&key, &step.outcome).await? && !step.next.contains(&key) {
            step.next.push(key);
        }
        Ok(step)
    }

    /// Steps denied while this worker held `key` leave their contexts
    /// pending; the holder picks them up once it lets go.
    async fn arrived_while_held(
        &self,
        key: &BatchKey,
        outcome: &AdvanceOutcome,
    ) -> FlowResult<bool> {
        let gate = self.node(&key.position)?.kind == NodeKind::Gate;
        let seen = match outcome {
            AdvanceOutcome::LockDenied => return Ok(false),
            AdvanceOutcome::Parked { .. } if gate => return Ok(false),
            AdvanceOutcome::Waiting { arrived, .. } => *arrived,
            AdvanceOutcome::Advanced { .. }
            | AdvanceOutcome::Parked { .. }
            | AdvanceOutcome::Idle => 0,
        };
        let pending = self.services.contexts.find_batch(key, FlowStatus::Pending).await?;
        Ok(pending.len() > seen)
    }

    async fn requeue(&self, key: &BatchKey, taken: &[Uuid]) -> FlowResult<Step> {
        warn!(
            stream_id = %key.stream_id,
            position = %key.position,
            to_batch = ?key.to_batch,
            count = taken.len(),
            "Requeueing contexts after lock loss"
        );
        let wait = self.services.config.lock.wait();
        let Some(token) = self.services.locks.acquire(key, wait).await? else {
            return Err(FlowError::LockLost { key: key.to_string() });
        };
        let result = self.reset_taken(&token, taken).await;
        self.services.locks.release(token).await?;
        result?;
        Ok(Step {
            outcome: AdvanceOutcome::Idle,
            next: vec![key.clone()],
        })
    }

    async fn reset_taken(&self, token: &LockToken, taken: &[Uuid]) -> FlowResult<()> {
        let mut contexts = self.services.contexts.find_by_ids(taken).await?;
        contexts.retain(|c| c.status == FlowStatus::Processing);
        for ctx in &mut contexts {
            ctx.transition(FlowStatus::Pending)?;
        }
        self.commit(token, &contexts, "requeue").await
    }

    async fn release_retryable(&self, key: &BatchKey, token: &LockToken) -> FlowResult<usize> {
        let mut contexts = self.services.contexts.find_batch(key, FlowStatus::Retryable).await?;
        for ctx in &mut contexts {
            ctx.transition(FlowStatus::Pending)?;
            ctx.error = None;
        }
        self.commit(token, &contexts, "reinject").await?;
        if !contexts.is_empty() {
            info!(
                stream_id = %key.stream_id,
                position = %key.position,
                to_batch = ?key.to_batch,
                count = contexts.len(),
                "Re-injected retryable contexts"
            );
        }
        Ok(contexts.len())
    }

    async fn process(
        &self,
        key: &BatchKey,
        token: &LockToken,
        taken: &mut Vec<Uuid>,
    ) -> FlowResult<Step> {
        let node = self.node(&key.position)?;
        let mut contexts = self.services.contexts.find_batch(key, FlowStatus::Pending).await?;
        if contexts.is_empty() {
            return Ok(Step::done(AdvanceOutcome::Idle));
        }

        if node.kind == NodeKind::Gate {
            return Ok(self.park(key, contexts.len()).await);
        }

        let mut again = false;
        if let Some(fan_in) = &node.fan_in {
            let arrived = contexts.len();
            match fan_in.take(arrived) {
                None => {
                    debug!(
                        stream_id = %key.stream_id,
                        position = %key.position,
                        to_batch = ?key.to_batch,
                        arrived,
                        required = fan_in.min,
                        "Fan-in waiting"
                    );
                    return Ok(Step::done(AdvanceOutcome::Waiting {
                        arrived,
                        required: fan_in.min,
                    }));
                }
                Some(take) if take < arrived => {
                    contexts.truncate(take);
                    again = true;
                }
                Some(_) => {}
            }
        }

        for ctx in &mut contexts {
            ctx.transition(FlowStatus::Processing)?;
        }
        self.commit(token, &contexts, "take").await?;
        taken.extend(contexts.iter().map(|c| c.id));

        let mut step = match node.kind {
            NodeKind::State => self.run_state(node, key, token, contexts).await?,
            NodeKind::Condition => self.run_condition(node, key, token, contexts).await?,
            NodeKind::Parallel => self.run_parallel(node, key, token, contexts).await?,
            NodeKind::End => self.run_end(key, token, contexts).await?,
            NodeKind::Gate => {
                let message = format!("Gate '{}' cannot take contexts", node.id);
                return Err(FlowError::Internal(message));
            }
        };
        if again {
            step.next.push(key.clone());
        }
        Ok(step)
    }

    async fn park(&self, key: &BatchKey, count: usize) -> Step {
        debug!(
            stream_id = %key.stream_id,
            position = %key.position,
            to_batch = ?key.to_batch,
            count,
            "Contexts parked"
        );
        self.services
            .events
            .emit(
                TRACE_PAUSED,
                Some(json!({
                    "stream_id": key.stream_id,
                    "position": key.position,
                    "to_batch": key.to_batch,
                    "count": count,
                })),
            )
            .await;
        Step::done(AdvanceOutcome::Parked { count })
    }

    async fn run_state(
        &self,
        node: &FlowNode,
        key: &BatchKey,
        token: &LockToken,
        contexts: Vec<FlowContext<T>>,
    ) -> FlowResult<Step> {
        let jober = self.jober(&node.id).ok_or_else(|| {
            FlowError::Internal(format!("No jober bound to state node '{}'", node.id))
        })?;
        let target = &node.events[0].target;

        let result = jober.execute(&contexts).await;
        let successors = match result {
            Ok(JoberOutput::Dispatched) => return Ok(self.park(key, contexts.len()).await),
            Ok(JoberOutput::Mapped(outputs)) if outputs.len() == contexts.len() => contexts
                .iter()
                .zip(outputs)
                .map(|(ctx, data)| ctx.derive(target.clone(), data))
                .collect::<Vec<_>>(),
            Ok(JoberOutput::Produced(groups)) if groups.len() == contexts.len() => contexts
                .iter()
                .zip(groups)
                .flat_map(|(ctx, group)| {
                    let batch = Uuid::new_v4();
                    group
                        .into_iter()
                        .map(move |data| ctx.derive(target.clone(), data).with_batch(batch))
                })
                .collect(),
            Ok(_) => {
                let error = JoberError::fatal(format!(
                    "Jober '{}' returned a result count that does not match {} inputs",
                    jober.name(),
                    contexts.len()
                ));
                return self.handle_failure(node, key, token, contexts, error).await;
            }
            Err(error) => return self.handle_failure(node, key, token, contexts, error).await,
        };

        let step = self.forward(token, key, contexts, successors, 0).await?;
        if let Some(batch) = key.to_batch {
            self.services.retries.delete(batch).await?;
        }
        Ok(step)
    }

    async fn run_condition(
        &self,
        node: &FlowNode,
        key: &BatchKey,
        token: &LockToken,
        contexts: Vec<FlowContext<T>>,
    ) -> FlowResult<Step> {
        let mut routed = Vec::new();
        let mut successors = Vec::new();
        let mut unmatched = Vec::new();
        for ctx in contexts {
            let view = serde_json::to_value(&ctx.data)?;
            match node.route(&view) {
                Some(event) => {
                    debug!(
                        stream_id = %ctx.stream_id,
                        trace_id = %ctx.trace_id,
                        position = %node.id,
                        event = %event.id,
                        target = %event.target,
                        "Guard matched"
                    );
                    successors.push(ctx.derive(event.target.clone(), ctx.data.clone()));
                    routed.push(ctx);
                }
                None => unmatched.push(ctx),
            }
        }

        let failed = unmatched.len();
        for ctx in unmatched {
            let error = FlowError::GuardExhausted {
                node: node.id.clone(),
                context_id: ctx.id,
            };
            self.fail_contexts(key, token, vec![ctx], &error).await?;
        }
        if routed.is_empty() {
            return Ok(Step::done(AdvanceOutcome::Advanced {
                processed: failed,
                emitted: 0,
                failed,
            }));
        }
        self.forward(token, key, routed, successors, failed).await
    }

    async fn run_parallel(
        &self,
        node: &FlowNode,
        key: &BatchKey,
        token: &LockToken,
        contexts: Vec<FlowContext<T>>,
    ) -> FlowResult<Step> {
        let mut successors = Vec::with_capacity(contexts.len() * node.events.len());
        for ctx in &contexts {
            let batch = Uuid::new_v4();
            for event in &node.events {
                let successor = ctx.derive(event.target.clone(), ctx.data.clone());
                successors.push(successor.with_batch(batch));
            }
        }
        self.forward(token, key, contexts, successors, 0).await
    }

    async fn run_end(
        &self,
        key: &BatchKey,
        token: &LockToken,
        mut contexts: Vec<FlowContext<T>>,
    ) -> FlowResult<Step> {
        for ctx in &mut contexts {
            ctx.transition(FlowStatus::Archived)?;
        }
        self.commit(token, &contexts, "archive").await?;

        for handler in &self.completion {
            if catch_unwind(AssertUnwindSafe(|| handler(&contexts))).is_err() {
                error!(
                    stream_id = %key.stream_id,
                    position = %key.position,
                    "Completion handler panicked"
                );
            }
        }
        let traces: HashSet<Uuid> = contexts.iter().map(|c| c.trace_id).collect();
        info!(
            stream_id = %key.stream_id,
            position = %key.position,
            to_batch = ?key.to_batch,
            count = contexts.len(),
            "Contexts archived"
        );
        self.services
            .events
            .emit(
                TRACE_ARCHIVED,
                Some(json!({
                    "stream_id": key.stream_id,
                    "position": key.position,
                    "traces": traces,
                    "count": contexts.len(),
                })),
            )
            .await;

        Ok(Step::done(AdvanceOutcome::Advanced {
            processed: contexts.len(),
            emitted: 0,
            failed: 0,
        }))
    }

    /// Persists successors and archives their origins in one write.
    async fn forward(
        &self,
        token: &LockToken,
        key: &BatchKey,
        mut origins: Vec<FlowContext<T>>,
        successors: Vec<FlowContext<T>>,
        failed: usize,
    ) -> FlowResult<Step> {
        for ctx in &mut origins {
            ctx.transition(FlowStatus::Archived)?;
        }
        let fence = || token.ensure_valid();
        let (saved, archived) = self
            .services
            .contexts
            .advance(&successors, &origins, &fence)
            .await?;
        FlowError::check_affected("emit", successors.len(), saved)?;
        FlowError::check_affected("archive", origins.len(), archived)?;

        let mut next: Vec<BatchKey> = Vec::new();
        for successor in &successors {
            let key = successor.batch_key();
            if !next.contains(&key) {
                next.push(key);
            }
        }

        debug!(
            stream_id = %key.stream_id,
            position = %key.position,
            to_batch = ?key.to_batch,
            processed = origins.len(),
            emitted = successors.len(),
            "Batch advanced"
        );
        self.services
            .events
            .emit(
                TRACE_ADVANCED,
                Some(json!({
                    "stream_id": key.stream_id,
                    "position": key.position,
                    "to_batch": key.to_batch,
                    "emitted": successors.len(),
                })),
            )
            .await;

        Ok(Step {
            outcome: AdvanceOutcome::Advanced {
                processed: origins.len() + failed,
                emitted: successors.len(),
                failed,
            },
            next,
        })
    }

    async fn handle_failure(
        &self,
        node: &FlowNode,
        key: &BatchKey,
        token: &LockToken,
        mut contexts: Vec<FlowContext<T>>,
        failure: JoberError,
    ) -> FlowResult<Step> {
        let count = contexts.len();
        let failed = Step::done(AdvanceOutcome::Advanced {
            processed: count,
            emitted: 0,
            failed: count,
        });

        if !failure.is_retryable() {
            let error = failure.into_flow_error(node.id.clone());
            self.fail_contexts(key, token, contexts, &error).await?;
            return Ok(failed);
        }

        let retry = &self.services.config.retry;
        let batch = key.to_batch.unwrap_or_else(Uuid::new_v4);
        if self.services.retries.is_max_retry_count(batch, retry.max_retries).await? {
            let error = FlowError::TaskRetryable {
                node: node.id.clone(),
                message: format!(
                    "{} (gave up after {} retries)",
                    failure.message, retry.max_retries
                ),
            };
            self.fail_contexts(key, token, contexts, &error).await?;
            self.services.retries.delete(batch).await?;
            return Ok(failed);
        }

        let attempt = self
            .services
            .retries
            .get_by_id(batch)
            .await?
            .map_or(1, |record| record.retry_count + 1);
        let delay = retry.delay_for(attempt);
        for ctx in &mut contexts {
            ctx.fail(FlowStatus::Retryable, failure.message.clone())?;
            ctx.to_batch = Some(batch);
        }
        self.commit(token, &contexts, "schedule_retry").await?;

        let backoff =
            chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let next_retry_at = Utc::now() + backoff;
        let record = RetryRecord::new(batch, key.stream_id.clone(), key.position.clone())
            .with_next_retry_at(next_retry_at)
            .with_error(failure.message.clone());
        let retry_count = self.services.retries.increment(record).await?;

        warn!(
            stream_id = %key.stream_id,
            position = %key.position,
            to_batch = %batch,
            retry_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %failure.message,
            "Task failed, retry scheduled"
        );
        self.services
            .events
            .emit(
                RETRY_SCHEDULED,
                Some(json!({
                    "stream_id": key.stream_id,
                    "position": key.position,
                    "to_batch": batch,
                    "retry_count": retry_count,
                    "next_retry_at": next_retry_at,
                })),
            )
            .await;
        Ok(failed)
    }

    async fn fail_contexts(
        &self,
        key: &BatchKey,
        token: &LockToken,
        mut contexts: Vec<FlowContext<T>>,
        error: &FlowError,
    ) -> FlowResult<()> {
        let message = error.to_string();
        for ctx in &mut contexts {
            ctx.fail(FlowStatus::Error, message.clone())?;
        }
        self.commit(token, &contexts, "fail").await?;

        error!(
            stream_id = %key.stream_id,
            position = %key.position,
            to_batch = ?key.to_batch,
            count = contexts.len(),
            error = %message,
            "Contexts failed"
        );
        for handler in &self.error_handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&contexts, error))).is_err() {
                error!(
                    stream_id = %key.stream_id,
                    position = %key.position,
                    "Error handler panicked"
                );
            }
        }
        self.services
            .events
            .emit(
                TRACE_FAILED,
                Some(json!({
                    "stream_id": key.stream_id,
                    "position": key.position,
                    "contexts": contexts.iter().map(|c| c.id).collect::<Vec<_>>(),
                    "error": message,
                })),
            )
            .await;
        Ok(())
    }

    async fn resume_group(
        &self,
        key: &BatchKey,
        token: &LockToken,
        ids: &[Uuid],
        merge: &T,
    ) -> FlowResult<Vec<BatchKey>> {
        let node = self.node(&key.position)?;
        let parked = match node.kind {
            NodeKind::Gate => Some(FlowStatus::Pending),
            NodeKind::State if self.is_async(&node.id) => Some(FlowStatus::Processing),
            _ => None,
        };

        // Re-read under the lock; the first read only located the keys.
        let mut contexts = self.services.contexts.find_by_ids(ids).await?;
        for ctx in &contexts {
            if parked.is_some() && ctx.status == FlowStatus::Archived {
                return Err(FlowError::AlreadyResumed(ctx.id));
            }
            if Some(ctx.status) != parked || ctx.batch_key() != *key {
                return Err(FlowError::NotParked {
                    context_id: ctx.id,
                    position: ctx.position.clone(),
                    status: ctx.status.to_string(),
                });
            }
        }

        let batch = Uuid::new_v4();
        for ctx in &mut contexts {
            ctx.data.merge(merge.clone());
            ctx.to_batch = Some(batch);
        }
        let updated = self.services.contexts.update_data_and_batch(&contexts).await?;
        FlowError::check_affected("resume", contexts.len(), updated)?;
        info!(
            stream_id = %key.stream_id,
            position = %key.position,
            to_batch = %batch,
            count = contexts.len(),
            "Contexts resumed"
        );

        let target = &node.events[0].target;
        let successors = contexts
            .iter()
            .map(|ctx| ctx.derive(target.clone(), ctx.data.clone()))
            .collect();
        if parked == Some(FlowStatus::Pending) {
            for ctx in &mut contexts {
                ctx.transition(FlowStatus::Processing)?;
            }
        }
        let step = self.forward(token, key, contexts, successors, 0).await?;
        Ok(step.next)
    }

    async fn commit(
        &self,
        token: &LockToken,
        contexts: &[FlowContext<T>],
        operation: &str,
    ) -> FlowResult<()> {
        if contexts.is_empty() {
            return Ok(());
        }
        token.ensure_valid()?;
        let updated = self.services.contexts.update(contexts).await?;
        FlowError::check_affected(operation, contexts.len(), updated)
    }
}

impl<T: FlowData> fmt::Debug for FlowPipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowPipeline")
            .field("stream_id", &self.stream_id())
            .field("nodes", &self.definition.node_count())
            .field("jobers", &self.jobers.len())
            .finish_non_exhaustive()
    }
}
