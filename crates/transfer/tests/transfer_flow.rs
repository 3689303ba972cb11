use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use connector_core::{
    Asset, ContractAgreement, ContractNegotiation, ContractOffer, CounterParty, DataAddress,
    DataRequest, NegotiationRole, NegotiationState, Policy, ProvisionedDataDestinationResource,
    ProvisionedResource, ResourceDefinition, SecretToken, StateProcessor, TransferProcess,
    TransferState,
};
use connector_storage::{ConnectorStorage, InMemoryStorage};
use connector_transfer::{
    DeprovisionContext, InMemoryVault, ProvisionContext, ProvisionError, Provisioner,
    ProvisionerRegistry, TransferConfig, TransferError, TransferProcessManager, Vault,
};
use serde_json::{json, Value};

const AGREEMENT: &str = "def-1:agreement";

// ── Provisioners ────────────────────────────────────────────────────

/// Fails `failures` times, then provisions a bucket with a credential.
struct Scripted {
    failures: AtomicUsize,
    permanent: bool,
    calls: AtomicUsize,
    removed: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(failures: usize) -> Arc<Self> {
        Self::build(failures, false)
    }

    fn permanent() -> Arc<Self> {
        Self::build(0, true)
    }

    fn build(failures: usize, permanent: bool) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            permanent,
            calls: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for Scripted {
    fn kind(&self) -> &str {
        "bucket"
    }

    async fn provision(&self, definition: ResourceDefinition, context: ProvisionContext) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent {
            return context.failed(ProvisionError::Permanent("bucket name taken".into()));
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return context.failed(ProvisionError::Transient("quota exceeded".into()));
        }
        if context.find().await.unwrap().is_none() {
            context.create(json!({ "request": "r-1" })).await.unwrap();
        }
        let bucket = format!("bucket-{}", definition.id);
        context.callback_with_secret(
            ProvisionedDataDestinationResource {
                resource: ProvisionedResource {
                    id: bucket.clone(),
                    transfer_process_id: String::new(),
                    resource_definition_id: String::new(),
                    properties: BTreeMap::new(),
                },
                destination: DataAddress::new("bucket").with_property("name", bucket),
            },
            SecretToken {
                value: "token-1".into(),
                expiration: None,
            },
        );
    }

    async fn deprovision(&self, resource: ProvisionedResource, context: DeprovisionContext) {
        self.removed.lock().unwrap().push(resource.id);
        context.deprovisioned(None);
    }
}

/// Holds on to its contexts so a test can answer them by hand.
#[derive(Default)]
struct Manual {
    pending: Mutex<Vec<ProvisionContext>>,
    removed: Mutex<Vec<String>>,
}

impl Manual {
    fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Unanswered requests for one definition.
    fn outstanding(&self, definition_id: &str) -> usize {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.resource_definition_id() == definition_id)
            .count()
    }

    fn take(&self, definition_id: &str) -> ProvisionContext {
        let mut pending = self.pending.lock().unwrap();
        let at = pending
            .iter()
            .position(|c| c.resource_definition_id() == definition_id)
            .unwrap();
        pending.remove(at)
    }
}

#[async_trait]
impl Provisioner for Manual {
    fn kind(&self) -> &str {
        "bucket"
    }

    async fn provision(&self, _: ResourceDefinition, context: ProvisionContext) {
        if context.find().await.unwrap().is_none() {
            context.create(json!({ "request": "r-1" })).await.unwrap();
        }
        self.pending.lock().unwrap().push(context);
    }

    async fn deprovision(&self, resource: ProvisionedResource, context: DeprovisionContext) {
        self.removed.lock().unwrap().push(resource.id);
        context.deprovisioned(None);
    }
}

/// Picks up where an earlier request left off.
#[derive(Default)]
struct Resuming {
    found: Mutex<Vec<Option<Value>>>,
}

#[async_trait]
impl Provisioner for Resuming {
    fn kind(&self) -> &str {
        "bucket"
    }

    async fn provision(&self, definition: ResourceDefinition, context: ProvisionContext) {
        let found = context.find().await.unwrap();
        self.found.lock().unwrap().push(found);
        context.callback(ProvisionedResource {
            id: format!("bucket-{}", definition.id),
            transfer_process_id: String::new(),
            resource_definition_id: String::new(),
            properties: BTreeMap::new(),
        });
    }

    async fn deprovision(&self, _: ProvisionedResource, context: DeprovisionContext) {
        context.deprovisioned(None);
    }
}

/// Never answers.
struct Dropping;

#[async_trait]
impl Provisioner for Dropping {
    fn kind(&self) -> &str {
        "bucket"
    }

    async fn provision(&self, _: ResourceDefinition, _context: ProvisionContext) {}

    async fn deprovision(&self, _: ProvisionedResource, _context: DeprovisionContext) {}
}

// ── Harness ─────────────────────────────────────────────────────────

async fn storage_with_agreement() -> Arc<InMemoryStorage> {
    let storage = Arc::new(InMemoryStorage::default());
    let now = connector_core::now_secs();
    let agreement = ContractAgreement::builder()
        .id(AGREEMENT)
        .provider_agent_id("provider")
        .consumer_agent_id("consumer")
        .contract_signing_date(now)
        .contract_start_date(now - 60)
        .contract_end_date(now + 3600)
        .asset_ids(vec!["asset-1".into()])
        .policy(Policy::permit_all())
        .build()
        .unwrap();
    let mut negotiation = ContractNegotiation::new(
        "n-1",
        NegotiationRole::Consumer,
        CounterParty {
            id: "provider".into(),
            address: "loopback://provider".into(),
            protocol: "loopback".into(),
        },
    )
    .unwrap();
    negotiation.add_offer(ContractOffer::new(
        "def-1",
        Policy::permit_all(),
        vec![Asset::new("asset-1")],
    ));
    negotiation.transition_to(NegotiationState::Requesting).unwrap();
    negotiation.transition_to(NegotiationState::Requested).unwrap();
    negotiation.attach_agreement(agreement).unwrap();
    negotiation.transition_to(NegotiationState::Confirmed).unwrap();

    let mut snapshot = storage.begin_snapshot().await.unwrap();
    storage
        .create_negotiation(&mut snapshot, negotiation)
        .await
        .unwrap();
    storage.commit_snapshot(snapshot).await.unwrap();
    storage
}

/// A manager that re-issues failed requests on the next pass.
fn manager(
    storage: &Arc<InMemoryStorage>,
    provisioner: Arc<dyn Provisioner>,
    vault: Arc<InMemoryVault>,
    max_retries: u32,
) -> TransferProcessManager<InMemoryStorage> {
    let config = TransferConfig {
        max_retries,
        retry_base_millis: 0,
        ..TransferConfig::default()
    };
    manager_with(storage, provisioner, vault, config)
}

fn manager_with(
    storage: &Arc<InMemoryStorage>,
    provisioner: Arc<dyn Provisioner>,
    vault: Arc<InMemoryVault>,
    config: TransferConfig,
) -> TransferProcessManager<InMemoryStorage> {
    let mut provisioners = ProvisionerRegistry::new();
    provisioners.register(provisioner);
    TransferProcessManager::new(storage.clone(), Arc::new(provisioners), vault, config)
}

fn request(asset: &str) -> DataRequest {
    DataRequest {
        id: "dr-1".into(),
        asset_id: asset.into(),
        contract_id: AGREEMENT.into(),
        destination: DataAddress::new("bucket"),
    }
}

fn bucket(id: &str) -> ResourceDefinition {
    ResourceDefinition::new(id, "bucket")
}

fn resource(id: &str) -> ProvisionedResource {
    ProvisionedResource {
        id: id.into(),
        transfer_process_id: String::new(),
        resource_definition_id: String::new(),
        properties: BTreeMap::new(),
    }
}

/// Run dispatch passes until the process reaches `state`.
async fn run_until(
    manager: &TransferProcessManager<InMemoryStorage>,
    id: &str,
    state: TransferState,
) -> TransferProcess {
    for _ in 0..200 {
        manager.process().await;
        let process = manager.get(id).await.unwrap();
        if process.state() == state {
            return process;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "process {id} never reached {state:?}: {:?}",
        manager.get(id).await.unwrap()
    );
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn provisions_then_deprovisions_with_secret_in_vault() {
    let storage = storage_with_agreement().await;
    let vault = Arc::new(InMemoryVault::new());
    let provisioner = Scripted::new(0);
    let manager = manager(&storage, provisioner.clone(), vault.clone(), 3);

    let id = manager
        .initiate(request("asset-1"), vec![bucket("rd-1")])
        .await
        .unwrap();
    let provisioned = run_until(&manager, &id, TransferState::Provisioned).await;

    let entry = &provisioned.provisioned()[0];
    assert_eq!(entry.resource.id, "bucket-rd-1");
    assert_eq!(entry.resource.transfer_process_id, id);
    assert_eq!(entry.secret_key.as_deref(), Some("bucket-rd-1-secret"));
    assert_eq!(
        provisioned.destination().unwrap().properties["name"],
        "bucket-rd-1"
    );
    let secret: SecretToken =
        serde_json::from_str(&vault.resolve_secret("bucket-rd-1-secret").await.unwrap()).unwrap();
    assert_eq!(secret.value, "token-1");
    assert!(storage.get_provision_data(&id, "rd-1").await.unwrap().is_none());

    manager.complete(&id).await.unwrap();
    let done = run_until(&manager, &id, TransferState::Deprovisioned).await;
    assert!(done.is_fully_deprovisioned());
    assert_eq!(*provisioner.removed.lock().unwrap(), vec!["bucket-rd-1"]);
    assert!(vault.is_empty());
}

#[tokio::test]
async fn initiate_requires_a_covering_agreement() {
    let storage = storage_with_agreement().await;
    let manager = manager(&storage, Scripted::new(0), Arc::new(InMemoryVault::new()), 3);

    let mut unknown = request("asset-1");
    unknown.contract_id = "def-1:nope".into();
    assert!(matches!(
        manager.initiate(unknown, vec![bucket("rd-1")]).await,
        Err(TransferError::UnknownAgreement(_))
    ));
    assert!(matches!(
        manager.initiate(request("asset-2"), vec![bucket("rd-1")]).await,
        Err(TransferError::AssetNotCovered { .. })
    ));
    assert!(storage
        .list_transfer_processes(None, 0)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let storage = storage_with_agreement().await;
    let provisioner = Scripted::new(1);
    let manager = manager(&storage, provisioner.clone(), Arc::new(InMemoryVault::new()), 3);

    let id = manager
        .initiate(request("asset-1"), vec![bucket("rd-1")])
        .await
        .unwrap();
    let provisioned = run_until(&manager, &id, TransferState::Provisioned).await;

    assert_eq!(provisioned.retry_count(), 1);
    assert_eq!(provisioner.calls(), 2);
}

#[tokio::test]
async fn exhausted_retries_move_to_error() {
    let storage = storage_with_agreement().await;
    let provisioner = Scripted::new(usize::MAX);
    let manager = manager(&storage, provisioner.clone(), Arc::new(InMemoryVault::new()), 2);

    let id = manager
        .initiate(request("asset-1"), vec![bucket("rd-1")])
        .await
        .unwrap();
    let failed = run_until(&manager, &id, TransferState::Error).await;

    assert_eq!(failed.retry_count(), 2);
    assert_eq!(provisioner.calls(), 3);
    assert!(failed.error_detail().unwrap().contains("quota exceeded"));
}

#[tokio::test]
async fn failed_request_is_reissued_alone() {
    let storage = storage_with_agreement().await;
    let provisioner = Arc::new(Manual::default());
    let manager = manager(&storage, provisioner.clone(), Arc::new(InMemoryVault::new()), 3);

    let id = manager
        .initiate(request("asset-1"), vec![bucket("rd-1"), bucket("rd-2")])
        .await
        .unwrap();
    manager.process().await;
    wait_for(|| provisioner.pending() == 2).await;

    provisioner
        .take("rd-1")
        .failed(ProvisionError::Transient("quota exceeded".into()));
    manager.process().await;
    wait_for(|| provisioner.outstanding("rd-1") == 1).await;

    assert_eq!(provisioner.outstanding("rd-2"), 1);
    let retrying = manager.get(&id).await.unwrap();
    assert_eq!(retrying.state(), TransferState::Provisioning);
    assert_eq!(retrying.retry_count(), 1);
    assert!(retrying.retrying().is_empty());

    provisioner.take("rd-2").callback(resource("bucket-b"));
    provisioner.take("rd-1").callback(resource("bucket-a"));
    let provisioned = run_until(&manager, &id, TransferState::Provisioned).await;
    let mut recorded: Vec<&str> = provisioned
        .provisioned()
        .iter()
        .map(|e| e.resource.id.as_str())
        .collect();
    recorded.sort_unstable();
    assert_eq!(recorded, vec!["bucket-a", "bucket-b"]);

    manager.complete(&id).await.unwrap();
    run_until(&manager, &id, TransferState::Deprovisioned).await;
    let mut removed = provisioner.removed.lock().unwrap().clone();
    removed.sort_unstable();
    assert_eq!(removed, vec!["bucket-a", "bucket-b"]);
}

#[tokio::test]
async fn failed_request_waits_for_its_backoff() {
    let storage = storage_with_agreement().await;
    let provisioner = Scripted::new(1);
    let config = TransferConfig {
        retry_base_millis: 60_000,
        ..TransferConfig::default()
    };
    let manager = manager_with(
        &storage,
        provisioner.clone(),
        Arc::new(InMemoryVault::new()),
        config,
    );

    let id = manager
        .initiate(request("asset-1"), vec![bucket("rd-1")])
        .await
        .unwrap();
    manager.process().await;
    wait_for(|| provisioner.calls() == 1).await;
    for _ in 0..5 {
        manager.process().await;
    }

    let waiting = manager.get(&id).await.unwrap();
    assert_eq!(waiting.state(), TransferState::Provisioning);
    assert_eq!(waiting.retry_count(), 1);
    assert_eq!(waiting.retrying(), &["rd-1".to_string()]);
    assert_eq!(provisioner.calls(), 1);
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let storage = storage_with_agreement().await;
    let provisioner = Scripted::permanent();
    let manager = manager(&storage, provisioner.clone(), Arc::new(InMemoryVault::new()), 3);

    let id = manager
        .initiate(request("asset-1"), vec![bucket("rd-1")])
        .await
        .unwrap();
    let failed = run_until(&manager, &id, TransferState::Error).await;

    assert_eq!(failed.retry_count(), 0);
    assert_eq!(provisioner.calls(), 1);
}

#[tokio::test]
async fn abandoned_request_counts_as_failure() {
    let storage = storage_with_agreement().await;
    let manager = manager(&storage, Arc::new(Dropping), Arc::new(InMemoryVault::new()), 0);

    let id = manager
        .initiate(request("asset-1"), vec![bucket("rd-1")])
        .await
        .unwrap();
    let failed = run_until(&manager, &id, TransferState::Error).await;
    assert!(failed.error_detail().unwrap().contains("abandoned"));
}

#[tokio::test]
async fn unknown_resource_kind_is_an_error() {
    let storage = storage_with_agreement().await;
    let manager = manager(&storage, Scripted::new(0), Arc::new(InMemoryVault::new()), 3);

    let id = manager
        .initiate(
            request("asset-1"),
            vec![ResourceDefinition::new("rd-1", "tape-drive")],
        )
        .await
        .unwrap();
    let failed = run_until(&manager, &id, TransferState::Error).await;
    assert!(failed.error_detail().unwrap().contains("tape-drive"));
}

#[tokio::test]
async fn empty_manifest_needs_no_provisioning() {
    let storage = storage_with_agreement().await;
    let manager = manager(&storage, Scripted::new(0), Arc::new(InMemoryVault::new()), 3);

    let id = manager.initiate(request("asset-1"), Vec::new()).await.unwrap();
    assert!(matches!(
        manager.complete(&id).await,
        Err(TransferError::InvalidState {
            state: TransferState::Initial,
            ..
        })
    ));

    run_until(&manager, &id, TransferState::Provisioned).await;
    manager.complete(&id).await.unwrap();
    run_until(&manager, &id, TransferState::Deprovisioned).await;
}

#[tokio::test]
async fn late_report_after_error_is_a_no_op() {
    let storage = storage_with_agreement().await;
    let vault = Arc::new(InMemoryVault::new());
    let provisioner = Arc::new(Manual::default());
    let manager = manager(&storage, provisioner.clone(), vault.clone(), 3);

    let id = manager
        .initiate(request("asset-1"), vec![bucket("rd-1"), bucket("rd-2")])
        .await
        .unwrap();
    manager.process().await;
    wait_for(|| provisioner.pending() == 2).await;

    provisioner
        .take("rd-1")
        .failed(ProvisionError::Permanent("region unavailable".into()));
    let failed = run_until(&manager, &id, TransferState::Error).await;

    provisioner.take("rd-2").callback_with_secret(
        ProvisionedDataDestinationResource {
            resource: ProvisionedResource {
                id: "late".into(),
                transfer_process_id: String::new(),
                resource_definition_id: String::new(),
                properties: BTreeMap::new(),
            },
            destination: DataAddress::new("bucket"),
        },
        SecretToken {
            value: "late-token".into(),
            expiration: None,
        },
    );
    manager.process().await;

    let after = manager.get(&id).await.unwrap();
    assert_eq!(after, failed);
    assert!(after.provisioned().is_empty());
    assert!(vault.is_empty());
}

#[tokio::test]
async fn recovery_resumes_from_provision_data() {
    let storage = storage_with_agreement().await;
    let stalled = Arc::new(Manual::default());
    let first = manager(&storage, stalled.clone(), Arc::new(InMemoryVault::new()), 3);

    let id = first
        .initiate(request("asset-1"), vec![bucket("rd-1")])
        .await
        .unwrap();
    first.process().await;
    wait_for(|| stalled.pending() == 1).await;
    assert_eq!(
        first.get(&id).await.unwrap().state(),
        TransferState::Provisioning
    );

    // A new manager over the same storage, as after a restart.
    let resuming = Arc::new(Resuming::default());
    let second = manager(&storage, resuming.clone(), Arc::new(InMemoryVault::new()), 3);
    assert_eq!(second.recover().await.unwrap(), 1);
    run_until(&second, &id, TransferState::Provisioned).await;

    assert_eq!(
        *resuming.found.lock().unwrap(),
        vec![Some(json!({ "request": "r-1" }))]
    );
    assert!(storage.get_provision_data(&id, "rd-1").await.unwrap().is_none());
}
