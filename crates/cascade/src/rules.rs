//! Cascade rules: (entity type, operation, predicate) → action.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use backbone_jobs::{EnqueueError, JobArgs, JobQueue, JobStore, NewJob, RegistryError, StoreError};

use crate::mutation::{Mutation, Operation};

#[derive(Debug, Error)]
pub enum CascadeError {
    /// The mutated entity does not have the shape the rule expects.
    #[error("rule '{rule}' cannot decode entity: {message}")]
    Decode { rule: String, message: String },

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A detached side effect failed.
    #[error("side effect failed: {0}")]
    Effect(String),
}

/// Async side effect run after commit, outside any transaction.
#[async_trait]
pub trait SideEffect: Send + Sync + 'static {
    async fn run(&self, mutation: &Mutation) -> Result<(), CascadeError>;
}

type Predicate = Box<dyn Fn(&JsonValue) -> Result<bool, String> + Send + Sync>;
type ToJob = Box<dyn Fn(&JsonValue) -> Result<NewJob, String> + Send + Sync>;

/// What a matching rule does.
pub enum CascadeAction {
    /// Insert a job inside the mutation's own transaction (transactional
    /// outbox). The job exists if and only if the mutation commits.
    Enqueue { kind: &'static str, to_job: ToJob },
    /// Run after commit in a detached task. At-most-once: lost if the process
    /// stops between commit and execution.
    Detached(Arc<dyn SideEffect>),
}

pub struct CascadeRule {
    name: String,
    entity_type: String,
    operation: Operation,
    predicate: Predicate,
    action: CascadeAction,
}

impl CascadeRule {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, mutation: &Mutation) -> bool {
        self.entity_type == mutation.entity_type && self.operation == mutation.operation
    }
}

fn decode<T: DeserializeOwned>(entity: &JsonValue) -> Result<T, String> {
    T::deserialize(entity).map_err(|e| e.to_string())
}

/// Collects rules at process start.
#[derive(Default)]
pub struct CascadesBuilder {
    rules: Vec<CascadeRule>,
}

impl CascadesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// When an `entity_type` entity decoding as `T` is `operation`-ed and
    /// `predicate` holds, enqueue `to_args(entity)` in the same transaction.
    pub fn on_commit_enqueue<T, A, P, F>(
        mut self,
        name: impl Into<String>,
        entity_type: impl Into<String>,
        operation: Operation,
        predicate: P,
        to_args: F,
    ) -> Self
    where
        T: DeserializeOwned + 'static,
        A: JobArgs,
        P: Fn(&T) -> bool + Send + Sync + 'static,
        F: Fn(&T) -> A + Send + Sync + 'static,
    {
        self.rules.push(CascadeRule {
            name: name.into(),
            entity_type: entity_type.into(),
            operation,
            predicate: Box::new(move |v| decode::<T>(v).map(|e| predicate(&e))),
            action: CascadeAction::Enqueue {
                kind: A::KIND,
                to_job: Box::new(move |v| {
                    let entity = decode::<T>(v)?;
                    NewJob::typed(&to_args(&entity)).map_err(|e| e.to_string())
                }),
            },
        });
        self
    }

    /// Fire-and-forget variant. Prefer [`CascadesBuilder::on_commit_enqueue`]
    /// unless the effect must not go through the job queue.
    pub fn on_commit_detached<T, P>(
        mut self,
        name: impl Into<String>,
        entity_type: impl Into<String>,
        operation: Operation,
        predicate: P,
        effect: Arc<dyn SideEffect>,
    ) -> Self
    where
        T: DeserializeOwned + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        warn!(rule = %name, "detached cascade registered; delivery is at-most-once on crash");
        self.rules.push(CascadeRule {
            name,
            entity_type: entity_type.into(),
            operation,
            predicate: Box::new(move |v| decode::<T>(v).map(|e| predicate(&e))),
            action: CascadeAction::Detached(effect),
        });
        self
    }

    /// Freeze the rules. Every enqueue rule must target a kind the queue accepts.
    pub fn build<B: JobStore>(self, queue: &JobQueue<B>) -> Result<Cascades<B>, RegistryError> {
        for rule in &self.rules {
            if let CascadeAction::Enqueue { kind, .. } = &rule.action {
                if !queue.knows(kind) {
                    return Err(RegistryError::UnknownKind(kind.to_string()));
                }
            }
        }
        Ok(Cascades {
            rules: Arc::new(self.rules),
            queue: queue.clone(),
        })
    }
}

/// Frozen rule set plus the queue outbox rules enqueue into.
pub struct Cascades<B: JobStore> {
    rules: Arc<Vec<CascadeRule>>,
    queue: JobQueue<B>,
}

impl<B: JobStore> Clone for Cascades<B> {
    fn clone(&self) -> Self {
        Self {
            rules: self.rules.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<B: JobStore> Cascades<B> {
    pub fn queue(&self) -> &JobQueue<B> {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate the rules for `mutation`: enqueue outbox jobs into `tx` and
    /// return the detached effects to run once `tx` has committed.
    pub async fn stage(&self, tx: &mut B::Tx, mutation: &Mutation) -> Result<Vec<Arc<dyn SideEffect>>, CascadeError> {
        let mut detached = Vec::new();

        for rule in self.rules.iter().filter(|r| r.applies_to(mutation)) {
            let matches = (rule.predicate)(&mutation.entity).map_err(|message| CascadeError::Decode {
                rule: rule.name.clone(),
                message,
            })?;
            if !matches {
                continue;
            }

            match &rule.action {
                CascadeAction::Enqueue { to_job, .. } => {
                    let job = to_job(&mutation.entity).map_err(|message| CascadeError::Decode {
                        rule: rule.name.clone(),
                        message,
                    })?;
                    let id = self.queue.enqueue_new_in(tx, job).await?;
                    debug!(rule = %rule.name, job_id = %id, entity_type = %mutation.entity_type, "cascade job staged");
                }
                CascadeAction::Detached(effect) => detached.push(effect.clone()),
            }
        }

        Ok(detached)
    }
}
