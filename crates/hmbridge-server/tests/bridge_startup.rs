use hmbridge_server::bridge::{Bridge, StartupError};
use hmbridge_server::config::{Config, ConfigError, InterfaceConfig, Secret};
use std::net::{IpAddr, Ipv4Addr};
use wiremock::matchers::{method, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const INIT_OK: &str = "<?xml version=\"1.0\"?><methodResponse><params><param>\
                       <value></value></param></params></methodResponse>";

fn bridge_config(dir: &tempfile::TempDir, ccu_url: String, notifier_url: String) -> Config {
    let mut config = Config::default();
    config.server.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
    config.server.port = 0;
    config.devices.monitored = vec!["ABC123".to_string()];
    config.ccu.username = "admin".to_string();
    config.ccu.password = Secret::new("hunter2");
    config.ccu.interfaces = vec![InterfaceConfig {
        name: "HmIP-RF".to_string(),
        url: ccu_url,
        register_id: Some("hmbridge-test".to_string()),
        callback_port: None,
    }];
    config.database.path = dir
        .path()
        .join("events.db")
        .to_str()
        .expect("utf-8 path")
        .to_string();
    config.notifier.url = notifier_url;
    config.notifier.timeout_secs = 2;
    config
}

fn event_body(param: &str, value: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?><methodCall><methodName>event</methodName><params>\
         <param><value>hmbridge-test</value></param>\
         <param><value>ABC123:1</value></param>\
         <param><value>{param}</value></param>\
         <param><value>{value}</value></param>\
         </params></methodCall>"
    )
}

#[tokio::test]
async fn full_lifecycle_registers_serves_and_unregisters() {
    // 1. CCU and notification endpoint
    let ccu = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INIT_OK))
        .expect(2)
        .mount(&ccu)
        .await;

    let notify = MockServer::start().await;
    Mock::given(method("GET"))
        .and(query_param("window_state", "ABC123:1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&notify)
        .await;

    // 2. Start: listener first, then registration
    let dir = tempfile::tempdir().expect("tempdir");
    let config = bridge_config(&dir, ccu.uri(), notify.uri());
    let bridge = Bridge::start(&config).await.expect("bridge starts");
    let addr = bridge.local_addrs()[0];

    let requests = ccu.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 1);
    let init = String::from_utf8_lossy(&requests[0].body).to_string();
    assert!(init.contains("<methodName>init</methodName>"));
    assert!(init.contains(&format!("http://127.0.0.1:{}", addr.port())));
    assert!(init.contains("hmbridge-test"));

    // 3. Window state change: cached, persisted, notified
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/"))
        .body(event_body("WINDOW_STATE", "1"))
        .send()
        .await
        .expect("event delivered");
    assert!(response.status().is_success());

    // 4. Level change: cached and persisted, no notification
    client
        .post(format!("http://{addr}/"))
        .body(event_body("LEVEL", "50"))
        .send()
        .await
        .expect("event delivered");

    let state = bridge.cache().get("ABC123:1");
    assert_eq!(state["WINDOW_STATE"], "1");
    assert_eq!(state["LEVEL"], "50");
    let records = bridge
        .pipeline()
        .gateway
        .records_for_device("ABC123")
        .expect("query");
    assert_eq!(records.len(), 2);

    // 5. Shutdown unregisters with an empty id and stops the listener
    bridge.shutdown().await;

    let requests = ccu.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 2);
    let deinit = String::from_utf8_lossy(&requests[1].body).to_string();
    assert!(deinit.contains("<methodName>init</methodName>"));
    assert!(!deinit.contains("hmbridge-test"));

    let refused = reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .body(event_body("LEVEL", "60"))
        .send()
        .await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn failed_registration_aborts_startup() {
    let ccu = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&ccu)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = bridge_config(&dir, ccu.uri(), "http://127.0.0.1:9".to_string());

    let err = Bridge::start(&config).await.err().expect("startup must fail");
    assert!(matches!(err, StartupError::Registration(_)));
}

#[tokio::test]
async fn failed_registration_unsubscribes_earlier_interfaces() {
    // 1. First interface accepts, second rejects
    let rf = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INIT_OK))
        .mount(&rf)
        .await;
    let virtual_ccu = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&virtual_ccu)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = bridge_config(&dir, rf.uri(), "http://127.0.0.1:9".to_string());
    config.ccu.interfaces = vec![
        InterfaceConfig {
            name: "HmIP-RF".to_string(),
            url: rf.uri(),
            register_id: Some("rf-id".to_string()),
            callback_port: None,
        },
        InterfaceConfig {
            name: "VirtualDevices".to_string(),
            url: virtual_ccu.uri(),
            register_id: Some("virtual-id".to_string()),
            callback_port: None,
        },
    ];

    // 2. Startup aborts on the second interface
    let err = Bridge::start(&config).await.err().expect("startup must fail");
    assert!(matches!(err, StartupError::Registration(_)));

    // 3. The first interface got its registration released
    let requests = rf.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 2);
    let init = String::from_utf8_lossy(&requests[0].body).to_string();
    assert!(init.contains("rf-id"));
    let deinit = String::from_utf8_lossy(&requests[1].body).to_string();
    assert!(deinit.contains("<methodName>init</methodName>"));
    assert!(!deinit.contains("rf-id"));
}

#[tokio::test]
async fn unreachable_ccu_aborts_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = bridge_config(
        &dir,
        "http://127.0.0.1:9".to_string(),
        "http://127.0.0.1:9".to_string(),
    );

    let err = Bridge::start(&config).await.err().expect("startup must fail");
    assert!(matches!(err, StartupError::Registration(_)));
}

#[tokio::test]
async fn invalid_config_is_rejected_before_binding() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = bridge_config(
        &dir,
        "http://127.0.0.1:9".to_string(),
        "http://127.0.0.1:9".to_string(),
    );
    config.devices.monitored.clear();

    let err = Bridge::start(&config).await.err().expect("startup must fail");
    assert!(matches!(
        err,
        StartupError::Config(ConfigError::Missing("devices.monitored"))
    ));
}

#[tokio::test]
async fn failing_unregister_does_not_block_shutdown() {
    let ccu = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INIT_OK))
        .up_to_n_times(1)
        .mount(&ccu)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&ccu)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let config = bridge_config(&dir, ccu.uri(), "http://127.0.0.1:9".to_string());
    let bridge = Bridge::start(&config).await.expect("bridge starts");
    let addr = bridge.local_addrs()[0];

    bridge.shutdown().await;

    let refused = reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .body(event_body("LEVEL", "60"))
        .send()
        .await;
    assert!(refused.is_err());
}
