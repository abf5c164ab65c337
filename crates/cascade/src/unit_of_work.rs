//! Unit of work that fires cascades on commit.

use std::sync::Arc;

use tracing::{error, warn};

use backbone_jobs::{JobStore, StoreError};

use crate::mutation::Mutation;
use crate::rules::{CascadeError, Cascades, SideEffect};

/// A transaction that records entity mutations.
///
/// Outbox cascades are inserted into the transaction as each mutation is
/// recorded, so they commit or roll back with it. Detached cascades are held
/// until [`UnitOfWork::commit`] succeeds and then spawned. Dropping the unit
/// of work without committing rolls everything back and fires nothing.
pub struct UnitOfWork<'a, B: JobStore> {
    cascades: &'a Cascades<B>,
    tx: B::Tx,
    detached: Vec<(Arc<dyn SideEffect>, Mutation)>,
}

impl<'a, B: JobStore> UnitOfWork<'a, B> {
    pub async fn begin(cascades: &'a Cascades<B>) -> Result<Self, StoreError> {
        let tx = cascades.queue().backend().begin().await?;
        Ok(Self {
            cascades,
            tx,
            detached: Vec::new(),
        })
    }

    pub fn store(&self) -> &'a B {
        self.cascades.queue().backend()
    }

    pub fn tx(&mut self) -> &mut B::Tx {
        &mut self.tx
    }

    /// Record a mutation made in this unit of work and stage its cascades.
    pub async fn record(&mut self, mutation: Mutation) -> Result<(), CascadeError> {
        let effects = self.cascades.stage(&mut self.tx, &mutation).await?;
        for effect in effects {
            self.detached.push((effect, mutation.clone()));
        }
        Ok(())
    }

    /// Commit, then start detached cascades. Returns how many were started.
    pub async fn commit(self) -> Result<usize, StoreError> {
        let Self {
            cascades,
            tx,
            detached,
        } = self;
        cascades.queue().backend().commit(tx).await?;

        let started = detached.len();
        for (effect, mutation) in detached {
            tokio::spawn(async move {
                if let Err(e) = effect.run(&mutation).await {
                    error!(
                        entity_type = %mutation.entity_type,
                        operation = ?mutation.operation,
                        error = %e,
                        "detached cascade failed; it will not be retried"
                    );
                }
            });
        }
        if started > 0 {
            warn!(started, "detached cascades started after commit");
        }
        Ok(started)
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.cascades.queue().backend().rollback(self.tx).await
    }
}
