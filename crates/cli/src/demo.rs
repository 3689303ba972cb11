//! `connector demo`: a provider and a consumer in one process, negotiating
//! over the loopback transport and provisioning the consumer's transfer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use connector_contract::{
    ClaimsAgentService, ConsumerNegotiationManager, ContractDefinitionService,
    ContractOfferQuery, ContractOfferRequest, ContractOfferService, ContractValidationService,
    DispatcherRegistry, InMemoryAssetIndex, InMemoryDefinitionStore, LoopbackDispatcher,
    LoopbackNetwork, NegotiationEndpoint, NegotiationListener, ProtocolHandler,
    ProviderNegotiationManager, LOOPBACK_PROTOCOL,
};
use connector_core::{
    ContractNegotiation, DataAddress, DataRequest, ExponentialWaitStrategy, NegotiationState,
    ProvisionedDataDestinationResource, ProvisionedResource, ResourceDefinition, SecretToken,
    StateMachineLoop, TransferState,
};
use connector_policy::RuleBasedPolicyEngine;
use connector_storage::{ConnectorStorage, InMemoryStorage};
use connector_transfer::{
    DeprovisionContext, InMemoryVault, ProvisionContext, Provisioner, ProvisionerRegistry,
    TransferProcessManager,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ConnectorConfig;
use crate::scenario::{Participant, Scenario, TransferPlan};

/// Resource kind served by [`MemoryProvisioner`].
const MEMORY_KIND: &str = "memory";

/// Outcome of one demo run.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct DemoSummary {
    pub offers: usize,
    pub offer_id: String,
    pub negotiation_id: String,
    pub negotiation_state: NegotiationState,
    pub agreement_id: Option<String>,
    pub transfer_id: Option<String>,
    pub transfer_state: Option<TransferState>,
    pub destination: Option<DataAddress>,
    /// Vault keys of the issued credentials.
    pub secret_keys: Vec<String>,
    pub detail: Option<String>,
}

impl DemoSummary {
    pub fn succeeded(&self) -> bool {
        self.negotiation_state == NegotiationState::Confirmed
            && self.transfer_state == Some(TransferState::Provisioned)
    }
}

// ── Provisioning ─────────────────────────────────────────────────────

/// Hands out in-memory destinations with a fresh credential each.
struct MemoryProvisioner;

#[async_trait]
impl Provisioner for MemoryProvisioner {
    fn kind(&self) -> &str {
        MEMORY_KIND
    }

    async fn provision(&self, definition: ResourceDefinition, context: ProvisionContext) {
        let id = format!("{}-{}", definition.id, Uuid::new_v4().simple());
        let mut destination = DataAddress::new(MEMORY_KIND).with_property("container", id.clone());
        for (key, value) in &definition.properties {
            destination = destination.with_property(key.clone(), value.clone());
        }
        tracing::debug!(process_id = %context.process_id(), resource = %id, "memory destination ready");
        context.callback_with_secret(
            ProvisionedDataDestinationResource {
                resource: ProvisionedResource {
                    id,
                    transfer_process_id: String::new(),
                    resource_definition_id: String::new(),
                    properties: BTreeMap::new(),
                },
                destination,
            },
            SecretToken {
                value: Uuid::new_v4().to_string(),
                expiration: None,
            },
        );
    }

    async fn deprovision(&self, resource: ProvisionedResource, context: DeprovisionContext) {
        tracing::debug!(resource = %resource.id, "memory destination released");
        context.deprovisioned(None);
    }
}

// ── Negotiation → transfer ───────────────────────────────────────────

#[derive(Debug)]
enum Settled {
    Confirmed {
        transfer: Result<String, String>,
    },
    Declined,
    Failed,
}

/// Starts the consumer's transfer once its negotiation is confirmed.
struct TransferStarter {
    transfers: Arc<TransferProcessManager<InMemoryStorage>>,
    plan: TransferPlan,
    settled: mpsc::UnboundedSender<Settled>,
}

impl TransferStarter {
    async fn start(&self, negotiation: &ContractNegotiation) -> Result<String, String> {
        let agreement = negotiation
            .agreement()
            .ok_or_else(|| format!("negotiation {} confirmed without agreement", negotiation.id()))?;
        let asset_id = agreement
            .asset_ids()
            .first()
            .ok_or_else(|| format!("agreement {} covers no asset", agreement.id()))?;
        let request = DataRequest {
            id: Uuid::new_v4().to_string(),
            asset_id: asset_id.clone(),
            contract_id: agreement.id().to_string(),
            destination: self.plan.destination.clone(),
        };
        self.transfers
            .initiate(request, self.plan.manifest.clone())
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl NegotiationListener for TransferStarter {
    async fn confirmed(&self, negotiation: &ContractNegotiation) {
        let transfer = self.start(negotiation).await;
        if let Err(error) = &transfer {
            tracing::error!(negotiation_id = %negotiation.id(), %error, "transfer not started");
        }
        let _ = self.settled.send(Settled::Confirmed { transfer });
    }

    async fn declined(&self, _negotiation: &ContractNegotiation) {
        let _ = self.settled.send(Settled::Declined);
    }

    async fn failed(&self, _negotiation: &ContractNegotiation) {
        let _ = self.settled.send(Settled::Failed);
    }
}

// ── Connectors ───────────────────────────────────────────────────────

struct Node {
    storage: Arc<InMemoryStorage>,
    offers: ContractOfferService,
    consumer: Arc<ConsumerNegotiationManager<InMemoryStorage>>,
    provider: Arc<ProviderNegotiationManager<InMemoryStorage>>,
    _endpoint: Arc<dyn ProtocolHandler>,
}

struct NodeParts<'a> {
    participant: &'a Participant,
    scenario: Option<&'a Scenario>,
    storage: Arc<InMemoryStorage>,
    listener: Option<Arc<dyn NegotiationListener>>,
}

impl Node {
    /// A connector bound at `loopback://<id>`. Only the provider serves the
    /// scenario's catalog.
    fn build(
        network: &Arc<LoopbackNetwork>,
        config: &ConnectorConfig,
        engine: &Arc<RuleBasedPolicyEngine>,
        parts: NodeParts<'_>,
    ) -> Self {
        let id = parts.participant.id.as_str();
        let agents = Arc::new(ClaimsAgentService::new(config.identity_claim.clone()));
        let (assets, definitions) = match parts.scenario {
            Some(scenario) => (scenario.assets.clone(), scenario.definitions.clone()),
            None => (Vec::new(), Vec::new()),
        };
        let index = Arc::new(InMemoryAssetIndex::new(assets));
        let definitions = Arc::new(ContractDefinitionService::new(
            Arc::new(InMemoryDefinitionStore::new(definitions)),
            engine.clone(),
        ));
        let validation = Arc::new(ContractValidationService::new(
            agents.clone(),
            definitions.clone(),
            index.clone(),
        ));
        let offers = ContractOfferService::new(agents, definitions, index);

        let mut dispatchers = DispatcherRegistry::new();
        dispatchers.register(Arc::new(LoopbackDispatcher::new(
            network.clone(),
            parts.participant.token(&config.identity_claim),
        )));
        let dispatchers = Arc::new(dispatchers);
        let negotiation = config.negotiation_for(id);

        let mut consumer = ConsumerNegotiationManager::new(
            parts.storage.clone(),
            validation.clone(),
            dispatchers.clone(),
            negotiation.clone(),
        );
        if let Some(listener) = parts.listener {
            consumer = consumer.with_listener(listener);
        }
        let consumer = Arc::new(consumer);
        let provider = Arc::new(ProviderNegotiationManager::new(
            parts.storage.clone(),
            validation,
            dispatchers,
            negotiation.clone(),
        ));
        let endpoint: Arc<dyn ProtocolHandler> =
            Arc::new(NegotiationEndpoint::new(consumer.clone(), provider.clone()));
        network.bind(negotiation.callback_address, &endpoint);

        Self {
            storage: parts.storage,
            offers,
            consumer,
            provider,
            _endpoint: endpoint,
        }
    }
}

// ── Run ──────────────────────────────────────────────────────────────

pub(crate) async fn run(
    scenario: &Scenario,
    config: &ConnectorConfig,
    timeout: Duration,
) -> Result<DemoSummary, String> {
    let deadline = Instant::now() + timeout;
    let network = LoopbackNetwork::new();
    let engine = Arc::new(config.policy_engine());

    let provider = Node::build(
        &network,
        config,
        &engine,
        NodeParts {
            participant: &scenario.provider,
            scenario: Some(scenario),
            storage: Arc::new(InMemoryStorage::default()),
            listener: None,
        },
    );

    let consumer_storage = Arc::new(InMemoryStorage::default());
    let vault = Arc::new(InMemoryVault::new());
    let mut provisioners = ProvisionerRegistry::new();
    provisioners.register(Arc::new(MemoryProvisioner));
    let transfers = Arc::new(TransferProcessManager::new(
        consumer_storage.clone(),
        Arc::new(provisioners),
        vault.clone(),
        config.transfer.clone(),
    ));
    let (settled_tx, mut settled) = mpsc::unbounded_channel();
    let consumer = Node::build(
        &network,
        config,
        &engine,
        NodeParts {
            participant: &scenario.consumer,
            scenario: None,
            storage: consumer_storage,
            listener: Some(Arc::new(TransferStarter {
                transfers: transfers.clone(),
                plan: scenario.transfer.clone(),
                settled: settled_tx,
            })),
        },
    );

    let consumer_token = scenario.consumer.token(&config.identity_claim);
    let offers = provider
        .offers
        .query_contract_offers(&ContractOfferQuery::new(consumer_token));
    let visible = offers.len();
    let offer = match &scenario.offer {
        Some(id) => offers.into_iter().find(|o| &o.id == id),
        None => offers.into_iter().next(),
    }
    .ok_or_else(|| match &scenario.offer {
        Some(id) => format!("offer '{id}' is not visible to '{}'", scenario.consumer.id),
        None => format!("no offers visible to '{}'", scenario.consumer.id),
    })?;
    let offer_id = offer.id.clone();
    tracing::info!(offers = visible, offer = %offer_id, "negotiating first offer");

    let (shutdown_tx, shutdown) = watch::channel(false);
    let negotiation_wait = || {
        ExponentialWaitStrategy::with_idle(
            config.negotiation.retry_base_millis,
            config.negotiation.idle_millis,
        )
    };
    let transfer = &config.transfer;
    let loops: Vec<JoinHandle<()>> = vec![
        StateMachineLoop::new(consumer.consumer.clone(), Box::new(negotiation_wait()))
            .spawn(shutdown.clone()),
        StateMachineLoop::new(provider.provider.clone(), Box::new(negotiation_wait()))
            .spawn(shutdown.clone()),
        StateMachineLoop::new(
            transfers.clone(),
            Box::new(ExponentialWaitStrategy::with_idle(
                transfer.retry_base_millis,
                transfer.idle_millis,
            )),
        )
        .spawn(shutdown),
    ];

    let outcome = run_to_completion(
        &consumer,
        &transfers,
        ContractOfferRequest {
            connector_address: format!("loopback://{}", scenario.provider.id),
            connector_id: scenario.provider.id.clone(),
            protocol: LOOPBACK_PROTOCOL.to_string(),
            offer,
        },
        &mut settled,
        deadline,
    )
    .await;

    let _ = shutdown_tx.send(true);
    for handle in loops {
        if let Err(error) = handle.await {
            tracing::warn!(%error, "dispatch loop ended abnormally");
        }
    }

    let (negotiation_id, transfer_id, mut detail) = outcome?;
    let negotiation = consumer
        .storage
        .get_negotiation(&negotiation_id)
        .await
        .map_err(|e| e.to_string())?
        .negotiation;
    if detail.is_none() {
        detail = negotiation
            .error_detail()
            .or(negotiation.decline_reason())
            .map(str::to_string);
    }

    let mut summary = DemoSummary {
        offers: visible,
        offer_id,
        negotiation_id,
        negotiation_state: negotiation.state(),
        agreement_id: negotiation.agreement().map(|a| a.id().to_string()),
        transfer_id: transfer_id.clone(),
        transfer_state: None,
        destination: None,
        secret_keys: Vec::new(),
        detail,
    };
    if let Some(transfer_id) = transfer_id {
        let process = transfers.get(&transfer_id).await.map_err(|e| e.to_string())?;
        summary.transfer_state = Some(process.state());
        summary.destination = process.destination().cloned();
        summary.secret_keys = process
            .provisioned()
            .iter()
            .filter_map(|e| e.secret_key.clone())
            .collect();
        if summary.detail.is_none() {
            summary.detail = process.error_detail().map(str::to_string);
        }
    }
    Ok(summary)
}

/// Negotiation id, transfer id and a failure note, once the negotiation has
/// settled and its transfer (if any) is provisioned or failed.
async fn run_to_completion(
    consumer: &Node,
    transfers: &TransferProcessManager<InMemoryStorage>,
    request: ContractOfferRequest,
    settled: &mut mpsc::UnboundedReceiver<Settled>,
    deadline: Instant,
) -> Result<(String, Option<String>, Option<String>), String> {
    let negotiation_id = consumer
        .consumer
        .initiate(request)
        .await
        .map_err(|e| e.to_string())?
        .negotiation_id;

    let remaining = deadline.saturating_duration_since(Instant::now());
    let transfer_id = match tokio::time::timeout(remaining, settled.recv()).await {
        Ok(Some(Settled::Confirmed { transfer: Ok(id) })) => id,
        Ok(Some(Settled::Confirmed { transfer: Err(error) })) => {
            return Ok((negotiation_id, None, Some(error)))
        }
        Ok(Some(Settled::Declined | Settled::Failed)) | Ok(None) => {
            return Ok((negotiation_id, None, None))
        }
        Err(_) => {
            return Ok((
                negotiation_id,
                None,
                Some("timed out waiting for the negotiation".to_string()),
            ))
        }
    };

    loop {
        let state = transfers
            .get(&transfer_id)
            .await
            .map_err(|e| e.to_string())?
            .state();
        if matches!(state, TransferState::Provisioned | TransferState::Error) {
            return Ok((negotiation_id, Some(transfer_id), None));
        }
        if Instant::now() >= deadline {
            return Ok((
                negotiation_id,
                Some(transfer_id),
                Some("timed out waiting for provisioning".to_string()),
            ));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
[provider]
id = "provider"

[consumer]
id = "consumer"
claims = { region = "eu" }

[[assets]]
id = "weather"
properties = { kind = "csv" }

[[definitions]]
id = "eu-weather"
selector = [{ left = "kind", operator = "eq", right = "csv" }]
contract_policy = { permissions = [{ action = "use" }] }

[[definitions.access_policy.permissions]]
constraints = [{ type = "atomic", left = "ids:absoluteSpatialPosition", operator = "eq", right = "eu" }]
"#;

    fn fast_config() -> ConnectorConfig {
        let mut config = ConnectorConfig::default();
        config.negotiation.idle_millis = 5;
        config.negotiation.retry_base_millis = 10;
        config.transfer.idle_millis = 5;
        config.transfer.retry_base_millis = 10;
        config
    }

    #[tokio::test]
    async fn scenario_is_confirmed_and_provisioned() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        let summary = run(&scenario, &fast_config(), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(summary.succeeded(), "{summary:?}");
        assert_eq!(summary.offers, 1);
        assert_eq!(summary.offer_id, "eu-weather");
        assert!(summary.agreement_id.unwrap().starts_with("eu-weather:"));
        assert_eq!(summary.destination.unwrap().kind, MEMORY_KIND);
        assert_eq!(summary.secret_keys.len(), 1);
        assert!(summary.secret_keys[0].ends_with("-secret"));
    }

    #[tokio::test]
    async fn invisible_offer_is_an_error() {
        let text = SCENARIO.replace("claims = { region = \"eu\" }", "claims = { region = \"us\" }");
        let scenario = Scenario::parse(&text).unwrap();
        let error = run(&scenario, &fast_config(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(error.contains("no offers visible to 'consumer'"));
    }

    #[tokio::test]
    async fn unknown_resource_kind_fails_the_transfer() {
        let text = format!(
            "{SCENARIO}\n[transfer]\nmanifest = [{{ id = \"rd-1\", kind = \"s3\" }}]\n"
        );
        let scenario = Scenario::parse(&text).unwrap();
        let summary = run(&scenario, &fast_config(), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(summary.negotiation_state, NegotiationState::Confirmed);
        assert_eq!(summary.transfer_state, Some(TransferState::Error));
        assert!(!summary.succeeded());
        assert!(summary.detail.unwrap().contains("s3"));
    }
}
