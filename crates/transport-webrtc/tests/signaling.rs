mod support;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use support::{FakeFactory, FakeNetwork, Script, host, relay};
use transport_bus::{Bus, BusError, LocalBus};
use transport_webrtc::{
    CandidateEnvelope, ClientConfig, ProviderConfig, RtcError, RtcProvider, connect, connect_peer,
};

fn provider_config() -> ProviderConfig {
    ProviderConfig {
        trickle_window: Duration::from_millis(20),
        ready_timeout: Duration::from_secs(5),
        max_segment_size: 64,
        ..ProviderConfig::default()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        ready_timeout: Duration::from_secs(5),
        max_segment_size: 64,
        ..ClientConfig::default()
    }
}

#[test_timeout::tokio_timeout_test(20, flavor = "multi_thread")]
async fn provider_and_client_exchange_messages() {
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let network = FakeNetwork::new();
    let answering = FakeFactory::on_network(
        Script::default()
            .candidate_at(0, host(1))
            .candidate_at(60, relay(2)),
        &network,
    );
    let offering = FakeFactory::on_network(Script::default().candidate_at(0, host(3)), &network);

    let provider = Arc::new(
        RtcProvider::setup(provider_config(), bus.clone(), answering.clone()).expect("provider"),
    );
    let echo = {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move {
            let accepted = provider.accept().await.expect("accepted peer");
            while let Ok(message) = accepted.peer.read().await {
                accepted.peer.write(message).await.expect("echo");
            }
            accepted.session_id
        })
    };

    let session = connect(client_config(), bus.clone(), offering.clone())
        .await
        .expect("connect");
    let session_id = session.session_id().to_string();
    let peer = session.into_peer(64);

    let message: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    peer.write(message.clone()).await.expect("write");
    let echoed = peer.read().await.expect("echo");
    assert_eq!(echoed.as_ref(), message.as_slice());

    peer.write(Bytes::new()).await.expect("empty write");
    assert_eq!(peer.read().await.expect("empty echo"), Bytes::new());

    let offerer_side = offering.only();
    assert!(
        offerer_side.applied().contains(&host(1)),
        "answer batch applied on the offering side"
    );
    let answerer_side = answering.only();
    assert!(
        answerer_side.applied().contains(&host(3)),
        "trickled offerer candidate applied on the answering side"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        offerer_side.applied().contains(&relay(2)),
        "streamed answerer candidate reaches the offering side"
    );

    peer.close().await.expect("close");
    let served = echo.await.expect("echo task");
    assert_eq!(served, session_id);
    assert!(offerer_side.is_closed());

    provider.shutdown().await;
    assert!(provider.accept().await.is_none());
}

#[test_timeout::tokio_timeout_test(10)]
async fn malformed_offer_request_is_an_invocation_error() {
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let config = provider_config();
    let _provider = RtcProvider::setup(
        config.clone(),
        bus.clone(),
        FakeFactory::new(Script::default()),
    )
    .expect("provider");

    let err = bus
        .call(&config.procedure_handle_offer, Bytes::from_static(b"not json"))
        .await
        .expect_err("rejected");
    assert!(matches!(err, BusError::Invocation(_)));
}

#[test_timeout::tokio_timeout_test(10)]
async fn invalid_configuration_is_rejected_before_bus_activity() {
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let factory = FakeFactory::new(Script::default());

    let err = RtcProvider::setup(
        ProviderConfig {
            topic_handle_remote_candidates: String::new(),
            ..provider_config()
        },
        bus.clone(),
        factory.clone(),
    )
    .err()
    .expect("invalid provider config");
    assert!(matches!(err, RtcError::Config(_)));
    assert!(!bus.unregister(&ProviderConfig::default().procedure_handle_offer));

    let err = connect(
        ClientConfig {
            procedure_offer: " ".into(),
            ..client_config()
        },
        bus,
        factory.clone(),
    )
    .await
    .err()
    .expect("invalid client config");
    assert!(matches!(err, RtcError::Config(_)));
    assert!(factory.connections().is_empty());
}

#[test_timeout::tokio_timeout_test(10)]
async fn missing_provider_fails_the_call() {
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let factory = FakeFactory::new(Script::default());
    let err = connect_peer(client_config(), bus, factory.clone())
        .await
        .err()
        .expect("nobody answers");
    assert!(matches!(err, RtcError::Bus(BusError::NoSuchProcedure(_))));
    assert!(factory.only().is_closed());
}

#[test_timeout::tokio_timeout_test(10, flavor = "multi_thread")]
async fn attempt_without_channel_times_out_and_is_evicted() {
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    // no network: descriptions are exchanged but no channel ever opens
    let answering = FakeFactory::new(Script::default());
    let offering = FakeFactory::new(Script::default());
    let provider = RtcProvider::setup(
        ProviderConfig {
            ready_timeout: Duration::from_millis(200),
            ..provider_config()
        },
        bus.clone(),
        answering.clone(),
    )
    .expect("provider");

    let err = connect(
        ClientConfig {
            ready_timeout: Duration::from_millis(200),
            ..client_config()
        },
        bus,
        offering.clone(),
    )
    .await
    .err()
    .expect("no channel");
    assert!(matches!(err, RtcError::AttemptTimeout(_)));
    assert!(offering.only().is_closed());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(provider.registry().is_empty(), "failed attempt evicted");
    assert!(answering.only().is_closed());
}

#[test_timeout::tokio_timeout_test(10, flavor = "multi_thread")]
async fn late_candidate_after_ttl_does_not_reopen_the_session() {
    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let network = FakeNetwork::new();
    let answering = FakeFactory::on_network(Script::default(), &network);
    let offering = FakeFactory::on_network(Script::default(), &network);
    let config = ProviderConfig {
        session_ttl: Duration::from_millis(300),
        ..provider_config()
    };
    let provider = RtcProvider::setup(config.clone(), bus.clone(), answering.clone())
        .expect("provider");

    let session = connect(client_config(), bus.clone(), offering)
        .await
        .expect("connect");
    let accepted = provider.accept().await.expect("accepted");
    assert_eq!(accepted.session_id, session.session_id());

    // an accepted session is still swept once it outlives the ttl
    while !provider.registry().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let late = serde_json::to_vec(&CandidateEnvelope {
        session_id: session.session_id().to_string(),
        candidate: host(9),
    })
    .expect("envelope");
    bus.publish(&config.topic_handle_remote_candidates, late.into())
        .expect("publish");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(provider.registry().is_empty(), "late candidate reopened the session");
    assert_eq!(answering.connections().len(), 1);
    assert!(!answering.only().applied().contains(&host(9)));
}
