//! The provisioner seam and the one-shot contexts provisioners report
//! through.
//!
//! Every provision or deprovision request gets its own context. Reporting
//! consumes the context, so a request resolves at most once; a context
//! dropped without a report resolves as [`ProvisionError::Abandoned`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use connector_core::{
    ProvisionedDataDestinationResource, ProvisionedEntry, ProvisionedResource,
    ResourceDefinition, SecretToken,
};
use connector_storage::{ConnectorStorage, ProvisionDataRecord, StorageError};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ProvisionError;

/// Creates and removes one kind of resource.
///
/// Both calls may return before the work is done; the outcome is reported
/// through the context whenever it is known.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// The resource kind this provisioner handles, matched against
    /// [`ResourceDefinition::kind`].
    fn kind(&self) -> &str;

    async fn provision(&self, definition: ResourceDefinition, context: ProvisionContext);

    async fn deprovision(&self, resource: ProvisionedResource, context: DeprovisionContext);
}

#[derive(Default, Clone)]
pub struct ProvisionerRegistry {
    provisioners: HashMap<String, Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provisioner under its kind, replacing any earlier one.
    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) {
        self.provisioners
            .insert(provisioner.kind().to_string(), provisioner);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Provisioner>> {
        self.provisioners.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.provisioners.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

// ── Reports ─────────────────────────────────────────────────────────

/// What a context reports back to the manager that issued it.
#[derive(Debug)]
pub(crate) enum ProvisionEvent {
    Provisioned {
        process_id: String,
        entry: ProvisionedEntry,
        secret: Option<SecretToken>,
    },
    ProvisionFailed {
        process_id: String,
        definition_id: String,
        error: ProvisionError,
    },
    Deprovisioned {
        process_id: String,
        resource_id: String,
        error: Option<ProvisionError>,
    },
}

pub(crate) type EventSender = mpsc::UnboundedSender<ProvisionEvent>;

/// Reporting handle for one provision request.
pub struct ProvisionContext {
    process_id: String,
    definition_id: String,
    events: Option<EventSender>,
    data: Option<Arc<dyn ProvisionDataStore>>,
}

impl ProvisionContext {
    pub(crate) fn new(
        process_id: impl Into<String>,
        definition_id: impl Into<String>,
        events: EventSender,
        data: Option<Arc<dyn ProvisionDataStore>>,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            definition_id: definition_id.into(),
            events: Some(events),
            data,
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn resource_definition_id(&self) -> &str {
        &self.definition_id
    }

    /// The resource exists.
    pub fn callback(self, resource: ProvisionedResource) {
        let entry = self.entry(resource, None);
        self.resolve(|process_id| ProvisionEvent::Provisioned {
            process_id,
            entry,
            secret: None,
        });
    }

    /// The resource exists, is the transfer's destination, and comes with a
    /// credential. The credential goes to the vault, not the process.
    pub fn callback_with_secret(
        self,
        destination: ProvisionedDataDestinationResource,
        secret: SecretToken,
    ) {
        let ProvisionedDataDestinationResource {
            resource,
            destination,
        } = destination;
        let entry = self.entry(resource, Some(destination));
        self.resolve(|process_id| ProvisionEvent::Provisioned {
            process_id,
            entry,
            secret: Some(secret),
        });
    }

    pub fn failed(self, error: ProvisionError) {
        let definition_id = self.definition_id.clone();
        self.resolve(|process_id| ProvisionEvent::ProvisionFailed {
            process_id,
            definition_id,
            error,
        });
    }

    // ── Auxiliary state ──────────────────────────────────────────────

    /// Save state the provisioner needs to pick up this request after a
    /// restart, such as the id of an outstanding cloud request.
    pub async fn create(&self, data: Value) -> Result<(), ProvisionError> {
        let store = self.store()?;
        Ok(store.create(self.record(data)).await?)
    }

    pub async fn update(&self, data: Value) -> Result<(), ProvisionError> {
        let store = self.store()?;
        Ok(store.update(self.record(data)).await?)
    }

    pub async fn find(&self) -> Result<Option<Value>, ProvisionError> {
        let store = self.store()?;
        let record = store.find(&self.process_id, &self.definition_id).await?;
        Ok(record.map(|r| r.data))
    }

    fn store(&self) -> Result<&dyn ProvisionDataStore, ProvisionError> {
        self.data.as_deref().ok_or(ProvisionError::Unsupported)
    }

    fn record(&self, data: Value) -> ProvisionDataRecord {
        ProvisionDataRecord::new(self.process_id.clone(), self.definition_id.clone(), data)
    }

    /// The resource as recorded on the process. Ids the provisioner cannot
    /// know better than this context are overwritten.
    fn entry(
        &self,
        mut resource: ProvisionedResource,
        destination: Option<connector_core::DataAddress>,
    ) -> ProvisionedEntry {
        resource.transfer_process_id = self.process_id.clone();
        resource.resource_definition_id = self.definition_id.clone();
        ProvisionedEntry {
            resource,
            destination,
            secret_key: None,
            deprovisioned: false,
        }
    }

    fn resolve(mut self, event: impl FnOnce(String) -> ProvisionEvent) {
        if let Some(events) = self.events.take() {
            let _ = events.send(event(self.process_id.clone()));
        }
    }
}

impl Drop for ProvisionContext {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            tracing::warn!(
                process_id = %self.process_id,
                definition_id = %self.definition_id,
                "provision context dropped without a report"
            );
            let _ = events.send(ProvisionEvent::ProvisionFailed {
                process_id: self.process_id.clone(),
                definition_id: self.definition_id.clone(),
                error: ProvisionError::Abandoned,
            });
        }
    }
}

/// Reporting handle for one deprovision request.
pub struct DeprovisionContext {
    process_id: String,
    resource_id: String,
    events: Option<EventSender>,
}

impl DeprovisionContext {
    pub(crate) fn new(
        process_id: impl Into<String>,
        resource_id: impl Into<String>,
        events: EventSender,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            resource_id: resource_id.into(),
            events: Some(events),
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Teardown finished; `error` is `None` on success.
    pub fn deprovisioned(mut self, error: Option<ProvisionError>) {
        if let Some(events) = self.events.take() {
            let _ = events.send(ProvisionEvent::Deprovisioned {
                process_id: self.process_id.clone(),
                resource_id: self.resource_id.clone(),
                error,
            });
        }
    }
}

impl Drop for DeprovisionContext {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            tracing::warn!(
                process_id = %self.process_id,
                resource_id = %self.resource_id,
                "deprovision context dropped without a report"
            );
            let _ = events.send(ProvisionEvent::Deprovisioned {
                process_id: self.process_id.clone(),
                resource_id: self.resource_id.clone(),
                error: Some(ProvisionError::Abandoned),
            });
        }
    }
}

// ── Provision data ──────────────────────────────────────────────────

/// Where contexts keep provisioners' auxiliary state.
#[async_trait]
pub trait ProvisionDataStore: Send + Sync {
    /// Fails with `AlreadyExists` if the request already has state.
    async fn create(&self, record: ProvisionDataRecord) -> Result<(), StorageError>;

    /// Fails with `NotFound` if the request has no state yet.
    async fn update(&self, record: ProvisionDataRecord) -> Result<(), StorageError>;

    async fn find(
        &self,
        process_id: &str,
        resource_definition_id: &str,
    ) -> Result<Option<ProvisionDataRecord>, StorageError>;
}

/// Provision data kept in the connector's own storage, one transaction per
/// call.
pub struct StorageProvisionData<S> {
    storage: Arc<S>,
}

impl<S: ConnectorStorage> StorageProvisionData<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: ConnectorStorage> ProvisionDataStore for StorageProvisionData<S> {
    async fn create(&self, record: ProvisionDataRecord) -> Result<(), StorageError> {
        let storage = self.storage.as_ref();
        let mut snapshot = storage.begin_snapshot().await?;
        if let Err(e) = storage.create_provision_data(&mut snapshot, record).await {
            let _ = storage.abort_snapshot(snapshot).await;
            return Err(e);
        }
        storage.commit_snapshot(snapshot).await
    }

    async fn update(&self, record: ProvisionDataRecord) -> Result<(), StorageError> {
        let storage = self.storage.as_ref();
        let mut snapshot = storage.begin_snapshot().await?;
        if let Err(e) = storage.update_provision_data(&mut snapshot, record).await {
            let _ = storage.abort_snapshot(snapshot).await;
            return Err(e);
        }
        storage.commit_snapshot(snapshot).await
    }

    async fn find(
        &self,
        process_id: &str,
        resource_definition_id: &str,
    ) -> Result<Option<ProvisionDataRecord>, StorageError> {
        self.storage
            .get_provision_data(process_id, resource_definition_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector_core::DataAddress;
    use connector_storage::InMemoryStorage;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn resource(id: &str) -> ProvisionedResource {
        ProvisionedResource {
            id: id.into(),
            transfer_process_id: "spoofed".into(),
            resource_definition_id: "spoofed".into(),
            properties: BTreeMap::new(),
        }
    }

    fn context(
        data: Option<Arc<dyn ProvisionDataStore>>,
    ) -> (ProvisionContext, mpsc::UnboundedReceiver<ProvisionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProvisionContext::new("tp-1", "rd-1", tx, data), rx)
    }

    #[test]
    fn callback_reports_once_with_context_ids() {
        let (ctx, mut rx) = context(None);
        ctx.callback(resource("bucket-1"));

        match rx.try_recv().unwrap() {
            ProvisionEvent::Provisioned {
                process_id,
                entry,
                secret,
            } => {
                assert_eq!(process_id, "tp-1");
                assert_eq!(entry.resource.id, "bucket-1");
                assert_eq!(entry.resource.transfer_process_id, "tp-1");
                assert_eq!(entry.resource.resource_definition_id, "rd-1");
                assert!(secret.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn secret_travels_beside_the_entry() {
        let (ctx, mut rx) = context(None);
        ctx.callback_with_secret(
            ProvisionedDataDestinationResource {
                resource: resource("bucket-1"),
                destination: DataAddress::new("memory").with_property("bucket", "b1"),
            },
            SecretToken {
                value: "token".into(),
                expiration: None,
            },
        );
        match rx.try_recv().unwrap() {
            ProvisionEvent::Provisioned { entry, secret, .. } => {
                assert_eq!(entry.destination.unwrap().kind, "memory");
                assert!(entry.secret_key.is_none());
                assert_eq!(secret.unwrap().value, "token");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn dropped_context_reports_abandoned() {
        let (ctx, mut rx) = context(None);
        drop(ctx);
        match rx.try_recv().unwrap() {
            ProvisionEvent::ProvisionFailed { error, .. } => {
                assert_eq!(error, ProvisionError::Abandoned)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_deprovision_context_reports_abandoned() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(DeprovisionContext::new("tp-1", "bucket-1", tx.clone()));
        DeprovisionContext::new("tp-1", "bucket-2", tx).deprovisioned(None);

        let mut errors = Vec::new();
        while let Ok(ProvisionEvent::Deprovisioned {
            resource_id, error, ..
        }) = rx.try_recv()
        {
            errors.push((resource_id, error));
        }
        assert_eq!(
            errors,
            vec![
                ("bucket-1".to_string(), Some(ProvisionError::Abandoned)),
                ("bucket-2".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn provision_data_is_unsupported_without_a_store() {
        let (ctx, _rx) = context(None);
        assert_eq!(
            ctx.create(json!({"request": "r-1"})).await,
            Err(ProvisionError::Unsupported)
        );
        assert_eq!(ctx.find().await, Err(ProvisionError::Unsupported));
        ctx.failed(ProvisionError::Permanent("test over".into()));
    }

    #[tokio::test]
    async fn provision_data_survives_in_storage() {
        let storage = Arc::new(InMemoryStorage::default());
        let store: Arc<dyn ProvisionDataStore> =
            Arc::new(StorageProvisionData::new(storage.clone()));
        let (ctx, _rx) = context(Some(store.clone()));

        assert_eq!(ctx.find().await.unwrap(), None);
        assert!(matches!(
            ctx.update(json!({"request": "r-0"})).await,
            Err(ProvisionError::Store(_))
        ));
        ctx.create(json!({"request": "r-1"})).await.unwrap();
        ctx.update(json!({"request": "r-2"})).await.unwrap();

        // A context issued after a restart sees the same state.
        let (again, _rx) = context(Some(store));
        assert_eq!(again.find().await.unwrap(), Some(json!({"request": "r-2"})));
        ctx.failed(ProvisionError::Abandoned);
        again.failed(ProvisionError::Abandoned);
    }

    #[test]
    fn registry_is_keyed_by_kind() {
        struct Noop(&'static str);

        #[async_trait]
        impl Provisioner for Noop {
            fn kind(&self) -> &str {
                self.0
            }

            async fn provision(&self, _: ResourceDefinition, _: ProvisionContext) {}

            async fn deprovision(&self, _: ProvisionedResource, _: DeprovisionContext) {}
        }

        let mut registry = ProvisionerRegistry::new();
        registry.register(Arc::new(Noop("s3")));
        registry.register(Arc::new(Noop("memory")));
        assert_eq!(registry.kinds(), vec!["memory", "s3"]);
        assert!(registry.get("s3").is_some());
        assert!(registry.get("azure").is_none());
    }
}
