//! Registration of every job kind, cascade rule and schema the worker runs.

use std::sync::Arc;

use backbone_cascade::{Cascades, CascadesBuilder, Operation};
use backbone_inventory::{InventoryStore, InventoryTables, MovementKind, ReleaseReservationHandler, StockMovement};
use backbone_jobs::{
    Dispatcher, DispatcherConfig, JobQueue, JobStore, MemoryBackend, PgBackend, Registry, RegistryError, StoreError,
};
use backbone_saga::SagaCoordinator;
use backbone_saga::offboarding::{
    AccessControl, AssetRegistry, CleanupAssetsHandler, ForwardCallsHandler, OffboardingSaga, OffboardingStore,
    OffboardingTables, RevokeCredentialsHandler, Telephony,
};
use backbone_submission::{CustomsDeclaration, ExternalSystem, IdempotentSubmitter, MarkerStore, MarkerTables};

use crate::clients::{HttpAccessControl, HttpAssetRegistry, HttpCustomsGateway, HttpTelephony};
use crate::config::CollaboratorsConfig;

/// Everything a store backend must provide to host the worker's job kinds.
pub trait WorkerStore: OffboardingStore + MarkerStore + InventoryStore {}

impl<B: OffboardingStore + MarkerStore + InventoryStore> WorkerStore for B {}

/// In-memory business tables for every domain, next to the job table.
#[derive(Debug, Clone, Default)]
pub struct WorkerTables {
    pub offboarding: OffboardingTables,
    pub markers: MarkerTables,
    pub inventory: InventoryTables,
}

macro_rules! tables_view {
    ($field:ident: $t:ty) => {
        impl AsRef<$t> for WorkerTables {
            fn as_ref(&self) -> &$t {
                &self.$field
            }
        }

        impl AsMut<$t> for WorkerTables {
            fn as_mut(&mut self) -> &mut $t {
                &mut self.$field
            }
        }
    };
}

tables_view!(offboarding: OffboardingTables);
tables_view!(markers: MarkerTables);
tables_view!(inventory: InventoryTables);

/// Backend for tests and local development.
pub type MemoryWorkerBackend = MemoryBackend<WorkerTables>;

/// The external systems handlers call.
#[derive(Clone)]
pub struct Collaborators {
    pub access: Arc<dyn AccessControl>,
    pub assets: Arc<dyn AssetRegistry>,
    pub telephony: Arc<dyn Telephony>,
    pub customs: Arc<dyn ExternalSystem<CustomsDeclaration>>,
}

impl Collaborators {
    pub fn http(config: &CollaboratorsConfig) -> reqwest::Result<Self> {
        let timeout = config.request_timeout();
        Ok(Self {
            access: Arc::new(HttpAccessControl::new(&config.access_url, timeout)?),
            assets: Arc::new(HttpAssetRegistry::new(&config.assets_url, timeout)?),
            telephony: Arc::new(HttpTelephony::new(&config.telephony_url, timeout)?),
            customs: Arc::new(HttpCustomsGateway::new(&config.customs_url, timeout)?),
        })
    }
}

pub fn registry<B: WorkerStore>(collaborators: &Collaborators) -> Result<Registry<B>, RegistryError> {
    Ok(Registry::builder()
        .register(SagaCoordinator::new(OffboardingSaga))?
        .register(RevokeCredentialsHandler::new(collaborators.access.clone()))?
        .register(CleanupAssetsHandler::new(collaborators.assets.clone()))?
        .register(ForwardCallsHandler::new(collaborators.telephony.clone()))?
        .register(IdempotentSubmitter::<CustomsDeclaration>::new(collaborators.customs.clone()))?
        .register(ReleaseReservationHandler)?
        .build())
}

fn declaration_for(movement: &StockMovement) -> CustomsDeclaration {
    CustomsDeclaration {
        movement_id: movement.id,
        sku: movement.sku.clone(),
        quantity: movement.quantity,
        destination: movement.destination.clone().unwrap_or_default(),
    }
}

/// Export movements are declared to customs through the outbox.
pub fn cascades<B: JobStore>(queue: &JobQueue<B>) -> Result<Cascades<B>, RegistryError> {
    CascadesBuilder::new()
        .on_commit_enqueue(
            "declare-exports",
            StockMovement::ENTITY_TYPE,
            Operation::Created,
            |m: &StockMovement| m.kind == MovementKind::Export,
            declaration_for,
        )
        .build(queue)
}

/// A ready-to-run worker over one backend.
pub struct Worker<B: JobStore> {
    pub queue: JobQueue<B>,
    pub registry: Registry<B>,
    pub cascades: Cascades<B>,
}

impl<B: WorkerStore> Worker<B> {
    pub fn assemble(backend: Arc<B>, collaborators: &Collaborators, default_max_attempts: u32) -> Result<Self, RegistryError> {
        let registry = registry::<B>(collaborators)?;
        let queue = JobQueue::new(backend, registry.kinds(), default_max_attempts);
        let cascades = cascades(&queue)?;
        Ok(Self { queue, registry, cascades })
    }

    pub fn dispatcher(&self, config: DispatcherConfig) -> Dispatcher<B> {
        Dispatcher::new(self.queue.clone(), self.registry.clone(), config)
    }
}

/// Create the job table and every domain table.
pub async fn ensure_schema(backend: &PgBackend) -> Result<(), StoreError> {
    backend.ensure_schema().await?;
    backbone_saga::offboarding::ensure_schema(backend).await?;
    backbone_submission::ensure_schema(backend).await?;
    backbone_inventory::ensure_schema(backend).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use backbone_saga::offboarding::{Offboard, UserId};
    use backbone_jobs::{EnqueueOptions, JobArgs};

    fn collaborators() -> Collaborators {
        Collaborators::http(&CollaboratorsConfig::default()).unwrap()
    }

    #[test]
    fn every_kind_is_registered_once() {
        let registry = registry::<MemoryWorkerBackend>(&collaborators()).unwrap();
        let mut kinds = registry.kinds();
        kinds.sort();
        assert_eq!(
            kinds,
            [
                "asset-cleanup",
                "call-forwarding",
                "credential-revocation",
                "customs-declaration",
                "offboard",
                "reservation-release",
            ]
        );
    }

    #[tokio::test]
    async fn assembled_queue_accepts_offboarding() {
        let worker = Worker::assemble(MemoryWorkerBackend::arc(), &collaborators(), 3).unwrap();
        assert!(worker.queue.knows(Offboard::KIND));
        assert_eq!(worker.cascades.len(), 1);
        worker
            .queue
            .enqueue(&Offboard { user_id: UserId(1) }, EnqueueOptions::default())
            .await
            .unwrap();
    }

    #[test]
    fn declaration_copies_the_export() {
        let movement = StockMovement::export("SKU-9", 3, "NO");
        let declaration = declaration_for(&movement);
        assert_eq!(declaration.movement_id, movement.id);
        assert_eq!(declaration.destination, "NO");
        assert_eq!(declaration.quantity, 3);
    }
}
