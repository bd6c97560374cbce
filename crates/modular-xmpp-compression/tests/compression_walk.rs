use std::sync::Arc;
use std::time::Duration;

use modular_xmpp_compression::{
    CompressionModuleDescriptor, COMPRESSION, COMPRESS_FEATURE_NAMESPACE, COMPRESS_NAMESPACE, ZLIB,
};
use modular_xmpp_fsm::event::ChannelListener;
use modular_xmpp_fsm::mock::{
    post_auth_features, MockServerScript, MockSession, MockTransport,
    MockTransportModuleDescriptor,
};
use modular_xmpp_fsm::states::AUTHENTICATED_AND_RESOURCE_BOUND;
use modular_xmpp_fsm::{
    ConnectionConfig, ConnectionConfiguration, ConnectionStateEvent, ModularConnection,
};
use modular_xmpp_types::{LoginContext, StreamFeature, TopLevelElement};
use tokio::sync::mpsc;

fn script(accept_compression: bool) -> MockServerScript {
    let mut script = MockServerScript {
        accept_compression,
        ..MockServerScript::default()
    };
    let mut features = post_auth_features();
    features.insert(StreamFeature::new("compression", COMPRESS_FEATURE_NAMESPACE).with_value(ZLIB));
    script.stream_features[1] = features;
    script
}

fn connection(compression_enabled: bool, script: MockServerScript) -> ModularConnection {
    let mut config = ConnectionConfig::default();
    config.connection.compression = compression_enabled;
    let configuration = ConnectionConfiguration::builder(config)
        .add_module(MockTransportModuleDescriptor::new(script))
        .add_module(CompressionModuleDescriptor::default())
        .build()
        .unwrap();
    ModularConnection::new(configuration, Arc::new(MockSession::new("juliet", "r0m30"))).unwrap()
}

fn listen(conn: &ModularConnection) -> mpsc::UnboundedReceiver<ConnectionStateEvent> {
    let (listener, rx) = ChannelListener::new();
    conn.add_state_machine_listener(Arc::new(listener));
    rx
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionStateEvent>) -> Vec<ConnectionStateEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn login_negotiates_compression() {
    let conn = connection(true, script(true));
    let mut rx = listen(&conn);

    conn.login(LoginContext::new("juliet", "r0m30")).await.unwrap();

    assert_eq!(conn.current_state(), AUTHENTICATED_AND_RESOURCE_BOUND);
    assert!(conn.is_using_compression());
    assert_eq!(conn.internal().filters().len(), 1);

    let transport = conn.module::<MockTransport>().unwrap();
    let sent = transport.sent_elements();
    assert!(sent.iter().any(|e| matches!(
        e,
        TopLevelElement::Nonza(n) if n.name.name == "compress" && n.name.namespace == COMPRESS_NAMESPACE
    )));
    let opens = sent
        .iter()
        .filter(|e| matches!(e, TopLevelElement::StreamOpen(_)))
        .count();
    assert_eq!(opens, 3);

    let events = drain(&mut rx).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ConnectionStateEvent::SuccessfullyTransitionedInto { state, result }
            if *state == COMPRESSION && result.message() == Some("zlib compression enabled")
    )));

    let stats = conn.stats();
    let zlib = &stats.filters["zlib"];
    assert_ne!(zlib.get("compressor-in-bytes"), Some("0"));
}

#[tokio::test]
async fn rejected_compression_falls_back_to_resource_binding() {
    let conn = connection(true, script(false));
    let mut rx = listen(&conn);

    conn.login(LoginContext::new("juliet", "r0m30")).await.unwrap();

    assert_eq!(conn.current_state(), AUTHENTICATED_AND_RESOURCE_BOUND);
    assert!(!conn.is_using_compression());
    assert!(conn.internal().filters().is_empty());

    let events = drain(&mut rx).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ConnectionStateEvent::TransitionFailed { to, .. } if *to == COMPRESSION
    )));
}

#[tokio::test]
async fn disabled_compression_is_not_possible() {
    let conn = connection(false, script(true));
    let mut rx = listen(&conn);

    conn.login(LoginContext::new("juliet", "r0m30")).await.unwrap();

    assert!(!conn.is_using_compression());
    let events = drain(&mut rx).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ConnectionStateEvent::TransitionNotPossible { to, reason, .. }
            if *to == COMPRESSION && reason.reason() == "stream compression disabled"
    )));
}

#[tokio::test]
async fn disconnect_removes_filter_and_keeps_stats() {
    let conn = connection(true, script(true));
    conn.login(LoginContext::new("juliet", "r0m30")).await.unwrap();

    conn.disconnect().await.unwrap();

    assert!(!conn.is_using_compression());
    assert!(conn.internal().filters().is_empty());
    assert!(conn.stats().filters.contains_key("zlib"));

    // A second login negotiates compression afresh.
    conn.login(LoginContext::new("juliet", "r0m30")).await.unwrap();
    assert!(conn.is_using_compression());
    assert_eq!(conn.internal().filters().len(), 1);
}
