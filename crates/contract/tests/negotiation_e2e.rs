//! Two connectors on one loopback network, driven by their polling loops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use connector_contract::{
    ClaimsAgentService, ConsumerNegotiationManager, ContractDefinitionService,
    ContractOfferQuery, ContractOfferRequest, ContractOfferService, ContractValidationService,
    DispatcherRegistry, InMemoryAssetIndex, InMemoryDefinitionStore, LoopbackDispatcher,
    LoopbackNetwork, NegotiationConfig, NegotiationEndpoint, NegotiationListener,
    ProtocolHandler, ProviderNegotiationManager, LOOPBACK_PROTOCOL,
};
use connector_core::{
    Asset, AssetSelectorExpression, ClaimToken, Constraint, ContractDefinition,
    ContractNegotiation, Criterion, FixedWaitStrategy, NegotiationRole, NegotiationState,
    Operator, Policy, StateMachineLoop, StateProcessor,
};
use connector_policy::{RuleBasedPolicyEngine, ABS_SPATIAL_POSITION};
use connector_storage::{ConnectorStorage, InMemoryStorage};
use tokio::sync::{mpsc, watch};

fn usage() -> Policy {
    Policy::permission(Some("use"), vec![])
}

fn eu_only() -> Policy {
    Policy::permission(
        None,
        vec![Constraint::atomic(ABS_SPATIAL_POSITION, Operator::Eq, "eu")],
    )
}

fn definitions() -> Vec<ContractDefinition> {
    vec![
        ContractDefinition {
            id: "open".into(),
            access_policy: Policy::permit_all(),
            contract_policy: usage(),
            selector: AssetSelectorExpression {
                criteria: vec![Criterion::new("kind", Operator::Eq, "csv")],
            },
        },
        ContractDefinition {
            id: "eu".into(),
            access_policy: eu_only(),
            contract_policy: usage(),
            selector: AssetSelectorExpression::for_asset("x"),
        },
    ]
}

fn assets() -> InMemoryAssetIndex {
    InMemoryAssetIndex::new([
        Asset::new("a1").with_property("kind", "csv"),
        Asset::new("a2").with_property("kind", "csv"),
        Asset::new("x").with_property("kind", "parquet"),
    ])
}

struct Terminal(mpsc::UnboundedSender<(String, NegotiationState)>);

#[async_trait]
impl NegotiationListener for Terminal {
    async fn confirmed(&self, negotiation: &ContractNegotiation) {
        let _ = self.0.send((negotiation.id().to_string(), negotiation.state()));
    }

    async fn failed(&self, negotiation: &ContractNegotiation) {
        let _ = self.0.send((negotiation.id().to_string(), negotiation.state()));
    }
}

struct Connector {
    storage: Arc<InMemoryStorage>,
    offers: ContractOfferService,
    consumer: Arc<ConsumerNegotiationManager<InMemoryStorage>>,
    provider: Arc<ProviderNegotiationManager<InMemoryStorage>>,
    _endpoint: Arc<dyn ProtocolHandler>,
}

fn connector(
    network: &Arc<LoopbackNetwork>,
    id: &str,
    credential: ClaimToken,
    events: mpsc::UnboundedSender<(String, NegotiationState)>,
) -> Connector {
    let storage = Arc::new(InMemoryStorage::default());
    let agents = Arc::new(ClaimsAgentService::default());
    let index = Arc::new(assets());
    let definitions = Arc::new(ContractDefinitionService::new(
        Arc::new(InMemoryDefinitionStore::new(definitions())),
        Arc::new(RuleBasedPolicyEngine::new()),
    ));
    let validation = Arc::new(ContractValidationService::new(
        agents.clone(),
        definitions.clone(),
        index.clone(),
    ));
    let offers = ContractOfferService::new(agents, definitions, index);

    let mut dispatchers = DispatcherRegistry::new();
    dispatchers.register(Arc::new(LoopbackDispatcher::new(network.clone(), credential)));
    let dispatchers = Arc::new(dispatchers);
    let config = NegotiationConfig::default()
        .with_connector_id(id)
        .with_callback_address(format!("loopback://{id}"));
    let listener = Arc::new(Terminal(events));

    let consumer = Arc::new(
        ConsumerNegotiationManager::new(
            storage.clone(),
            validation.clone(),
            dispatchers.clone(),
            config.clone(),
        )
        .with_listener(listener.clone()),
    );
    let provider = Arc::new(
        ProviderNegotiationManager::new(storage.clone(), validation, dispatchers, config)
            .with_listener(listener),
    );
    let endpoint: Arc<dyn ProtocolHandler> =
        Arc::new(NegotiationEndpoint::new(consumer.clone(), provider.clone()));
    network.bind(format!("loopback://{id}"), &endpoint);

    Connector {
        storage,
        offers,
        consumer,
        provider,
        _endpoint: endpoint,
    }
}

fn eu_token(id: &str) -> ClaimToken {
    ClaimToken::new()
        .with_claim("client_id", id)
        .with_claim("region", "eu")
}

#[test]
fn access_policy_gates_offers() {
    let network = LoopbackNetwork::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let provider = connector(&network, "provider", eu_token("provider"), tx);

    let us = ContractOfferQuery::new(
        ClaimToken::new()
            .with_claim("client_id", "c")
            .with_claim("region", "us"),
    );
    let offers = provider.offers.query_contract_offers(&us);
    assert_eq!(offers.len(), 2);
    assert!(offers.iter().all(|o| o.id == "open" && o.assets.len() == 1));
    assert!(offers.iter().all(|o| o.policy == usage()));

    let eu = ContractOfferQuery::new(eu_token("c"));
    let offers = provider.offers.query_contract_offers(&eu);
    assert_eq!(offers.len(), 3);
    assert_eq!(offers.iter().filter(|o| o.id == "eu").count(), 1);
}

#[tokio::test]
async fn queried_offer_negotiates_to_confirmation() {
    let network = LoopbackNetwork::new();
    let (consumer_tx, mut consumer_events) = mpsc::unbounded_channel();
    let (provider_tx, _provider_events) = mpsc::unbounded_channel();
    let consumer = connector(&network, "consumer", eu_token("consumer"), consumer_tx);
    let provider = connector(&network, "provider", eu_token("provider"), provider_tx);

    let offer = provider
        .offers
        .query_contract_offers(&ContractOfferQuery::new(eu_token("consumer")))
        .into_iter()
        .find(|o| o.id == "eu")
        .expect("eu offer visible to an eu participant");
    assert_eq!(offer.asset_ids(), vec!["x".to_string()]);

    let (shutdown_tx, shutdown) = watch::channel(false);
    let loops = vec![
        StateMachineLoop::new(consumer.consumer.clone(), Box::new(FixedWaitStrategy(5)))
            .spawn(shutdown.clone()),
        StateMachineLoop::new(provider.provider.clone(), Box::new(FixedWaitStrategy(5)))
            .spawn(shutdown.clone()),
    ];

    let response = consumer
        .consumer
        .initiate(ContractOfferRequest {
            connector_address: "loopback://provider".into(),
            connector_id: "provider".into(),
            protocol: LOOPBACK_PROTOCOL.into(),
            offer,
        })
        .await
        .unwrap();
    let id = response.negotiation_id;

    let (settled, state) = tokio::time::timeout(Duration::from_secs(5), consumer_events.recv())
        .await
        .expect("negotiation settles")
        .unwrap();
    assert_eq!(settled, id);
    assert_eq!(state, NegotiationState::Confirmed);

    shutdown_tx.send(true).unwrap();
    for handle in loops {
        handle.await.unwrap();
    }

    let negotiation = consumer.storage.get_negotiation(&id).await.unwrap().negotiation;
    assert_eq!(negotiation.state(), NegotiationState::Confirmed);
    let agreement = negotiation.agreement().expect("agreement attached");
    assert!(agreement.covers_asset("x"));
    assert!(agreement.id().starts_with("eu:"));

    let found = consumer
        .storage
        .find_agreement(agreement.id())
        .await
        .unwrap();
    assert_eq!(found.as_ref(), Some(agreement));

    let provider_side = provider.storage.list_negotiations(None, 0).await.unwrap();
    assert_eq!(provider_side.len(), 1);
    assert_eq!(provider_side[0].negotiation.role(), NegotiationRole::Provider);
    assert_eq!(
        provider_side[0].negotiation.state(),
        NegotiationState::Confirmed
    );
}

#[tokio::test]
async fn request_outside_access_policy_fails() {
    let network = LoopbackNetwork::new();
    let (consumer_tx, mut consumer_events) = mpsc::unbounded_channel();
    let (provider_tx, _provider_events) = mpsc::unbounded_channel();
    let us = ClaimToken::new()
        .with_claim("client_id", "consumer")
        .with_claim("region", "us");
    let consumer = connector(&network, "consumer", us, consumer_tx);
    let provider = connector(&network, "provider", eu_token("provider"), provider_tx);

    let id = consumer
        .consumer
        .initiate(ContractOfferRequest {
            connector_address: "loopback://provider".into(),
            connector_id: "provider".into(),
            protocol: LOOPBACK_PROTOCOL.into(),
            offer: connector_core::ContractOffer::new("eu", usage(), vec![Asset::new("x")]),
        })
        .await
        .unwrap()
        .negotiation_id;

    consumer.consumer.process().await;

    let (failed, state) = consumer_events.recv().await.unwrap();
    assert_eq!(failed, id);
    assert_eq!(state, NegotiationState::Error);
    let provider_side = provider.storage.list_negotiations(None, 0).await.unwrap();
    assert_eq!(provider_side.len(), 1);
    assert_eq!(provider_side[0].negotiation.state(), NegotiationState::Error);
}
