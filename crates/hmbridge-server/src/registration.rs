//! Registration of the callback listener with the CCU.
//!
//! The CCU learns where to push events through an `init(url, id)` call on
//! each interface endpoint. The same call with an empty id unsubscribes.

use hmbridge_xmlrpc::{encode_method_call, parse_method_response, RpcError, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, InterfaceConfig, Secret};

/// Request timeout for `init` calls.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors returned by [`RegistrationClient::register`].
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The request could not be sent or timed out.
    #[error("registration request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The CCU answered with a non-success HTTP status.
    #[error("CCU at {url} answered {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// The CCU answered with an XML-RPC fault.
    #[error("CCU at {url} rejected init: fault {code}: {message}")]
    Fault {
        url: String,
        code: i64,
        message: String,
    },

    /// The response body was not a readable XML-RPC response.
    #[error("unreadable response from {url}: {source}")]
    Response {
        url: String,
        #[source]
        source: RpcError,
    },
}

/// Basic-auth credentials for the CCU. The password is redacted in `Debug`.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
}

/// One registration with one CCU interface.
#[derive(Debug, Clone)]
pub struct RegistrationSession {
    /// Interface name, for logs.
    pub interface: String,
    /// RPC endpoint of the interface.
    pub target_url: String,
    /// Callback address in `host:port` form.
    pub callback_address: String,
    /// Identifier the CCU echoes as the first argument of every event.
    pub register_id: String,
    pub credentials: Credentials,
}

impl RegistrationSession {
    /// Builds a session. A random identifier is generated when the
    /// interface has none configured.
    pub fn new(interface: &InterfaceConfig, callback_address: String, credentials: Credentials) -> Self {
        let register_id = interface
            .register_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            interface: interface.name.clone(),
            target_url: interface.url.clone(),
            callback_address,
            register_id,
            credentials,
        }
    }

    /// The callback URL sent to the CCU.
    pub fn callback_url(&self) -> String {
        format!("http://{}", self.callback_address)
    }
}

/// Sends `init` calls for a set of sessions.
#[derive(Debug, Clone)]
pub struct RegistrationClient {
    client: reqwest::Client,
    sessions: Vec<RegistrationSession>,
}

impl RegistrationClient {
    /// Creates a client for `sessions`.
    ///
    /// # Errors
    ///
    /// Returns the underlying `reqwest::Error` if the HTTP client cannot be
    /// built.
    pub fn new(sessions: Vec<RegistrationSession>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REGISTRATION_TIMEOUT)
            .build()?;
        Ok(Self { client, sessions })
    }

    /// Builds one session per configured interface. `bound_port` maps an
    /// interface to the port its listener actually bound.
    pub fn sessions_from_config(
        config: &Config,
        bound_port: impl Fn(&InterfaceConfig) -> u16,
    ) -> Vec<RegistrationSession> {
        let credentials = Credentials {
            username: config.ccu.username.clone(),
            password: config.ccu.password.clone(),
        };
        let host = config.callback_host();
        config
            .ccu
            .interfaces
            .iter()
            .map(|interface| {
                let address = format_address(&host, bound_port(interface));
                RegistrationSession::new(interface, address, credentials.clone())
            })
            .collect()
    }

    pub fn sessions(&self) -> &[RegistrationSession] {
        &self.sessions
    }

    /// Registers every session, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first `RegistrationError` encountered.
    pub async fn register_all(&self) -> Result<(), RegistrationError> {
        for session in &self.sessions {
            self.register(session).await?;
        }
        Ok(())
    }

    /// Unregisters every session. Failures are logged only.
    pub async fn unregister_all(&self) {
        for session in &self.sessions {
            self.unregister(session).await;
        }
    }

    /// Announces the callback address to one interface.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError` when the request fails, the status is not
    /// a success, or the CCU answers with a fault.
    pub async fn register(&self, session: &RegistrationSession) -> Result<(), RegistrationError> {
        tracing::debug!(
            interface = %session.interface,
            url = %session.target_url,
            register_id = %session.register_id,
            "registering with CCU"
        );
        match self.init(session, &session.register_id).await {
            Ok(()) => {
                tracing::info!(
                    interface = %session.interface,
                    url = %session.target_url,
                    callback = %session.callback_url(),
                    register_id = %session.register_id,
                    "registered with CCU"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(interface = %session.interface, error = %e, "registration failed");
                Err(e)
            }
        }
    }

    /// Asks one interface to stop sending events. Never fails.
    pub async fn unregister(&self, session: &RegistrationSession) {
        tracing::debug!(interface = %session.interface, url = %session.target_url, "unregistering from CCU");
        match self.init(session, "").await {
            Ok(()) => tracing::info!(
                interface = %session.interface,
                register_id = %session.register_id,
                "unregistered from CCU"
            ),
            Err(e) => tracing::error!(interface = %session.interface, error = %e, "unregistration failed"),
        }
    }

    async fn init(&self, session: &RegistrationSession, register_id: &str) -> Result<(), RegistrationError> {
        let url = session.target_url.clone();
        let body = encode_method_call(
            "init",
            &[
                Value::from(session.callback_url()),
                Value::from(register_id),
            ],
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(
                &session.credentials.username,
                Some(session.credentials.password.expose()),
            )
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|source| RegistrationError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RegistrationError::Status { url, status });
        }

        let text = response
            .text()
            .await
            .map_err(|source| RegistrationError::Request {
                url: url.clone(),
                source,
            })?;
        // Some interfaces answer `init` with an empty body.
        if text.trim().is_empty() {
            return Ok(());
        }
        match parse_method_response(&text) {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(fault)) => Err(RegistrationError::Fault {
                url,
                code: fault.code,
                message: fault.message,
            }),
            Err(source) => Err(RegistrationError::Response { url, source }),
        }
    }
}

/// Joins host and port, bracketing bare IPv6 literals.
fn format_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const INIT_OK: &str = "<?xml version=\"1.0\"?><methodResponse><params><param>\
                           <value></value></param></params></methodResponse>";

    fn credentials() -> Credentials {
        Credentials {
            username: "admin".to_string(),
            password: Secret::new("hunter2"),
        }
    }

    fn session(url: String, register_id: Option<&str>) -> RegistrationSession {
        let interface = InterfaceConfig {
            name: "HmIP-RF".to_string(),
            url,
            register_id: register_id.map(str::to_string),
            callback_port: None,
        };
        RegistrationSession::new(&interface, "192.168.1.20:8701".to_string(), credentials())
    }

    #[test]
    fn missing_register_id_gets_a_uuid() {
        let a = session("http://ccu:2010".to_string(), None);
        let b = session("http://ccu:2010".to_string(), Some(" "));
        assert!(uuid::Uuid::parse_str(&a.register_id).is_ok());
        assert!(uuid::Uuid::parse_str(&b.register_id).is_ok());
        assert_ne!(a.register_id, b.register_id);
        assert_ne!(a.register_id, a.interface);

        let fixed = session("http://ccu:2010".to_string(), Some("hmbridge"));
        assert_eq!(fixed.register_id, "hmbridge");
        assert_eq!(fixed.callback_url(), "http://192.168.1.20:8701");
    }

    #[test]
    fn ipv6_callback_host_is_bracketed() {
        assert_eq!(format_address("fd00::5", 8701), "[fd00::5]:8701");
        assert_eq!(format_address("[fd00::5]", 8701), "[fd00::5]:8701");
        assert_eq!(format_address("bridge.local", 8701), "bridge.local:8701");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let rendered = format!("{:?}", credentials());
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn register_sends_init_with_callback_and_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("authorization"))
            .and(header("content-type", "text/xml"))
            .and(body_string_contains("<methodName>init</methodName>"))
            .and(body_string_contains("http://192.168.1.20:8701"))
            .and(body_string_contains("hmbridge-rf"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INIT_OK))
            .expect(1)
            .mount(&server)
            .await;

        let session = session(server.uri(), Some("hmbridge-rf"));
        let client = RegistrationClient::new(vec![session.clone()]).expect("client");
        client.register(&session).await.expect("registered");
    }

    #[tokio::test]
    async fn register_propagates_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = RegistrationClient::new(vec![session(server.uri(), None)]).expect("client");
        let err = client.register_all().await.expect_err("401 must fail");
        assert!(matches!(err, RegistrationError::Status { .. }));
    }

    #[tokio::test]
    async fn register_propagates_fault() {
        let server = MockServer::start().await;
        let fault = hmbridge_xmlrpc::encode_fault(&hmbridge_xmlrpc::Fault::new(-1, "Failure"));
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(fault))
            .mount(&server)
            .await;

        let session = session(server.uri(), None);
        let client = RegistrationClient::new(vec![session.clone()]).expect("client");
        let err = client.register(&session).await.expect_err("fault must fail");
        assert!(matches!(err, RegistrationError::Fault { code: -1, .. }));
    }

    #[tokio::test]
    async fn unregister_sends_empty_id_and_swallows_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("<methodName>init</methodName>"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let session = session(server.uri(), Some("hmbridge-rf"));
        let client = RegistrationClient::new(vec![session]).expect("client");
        client.unregister_all().await;

        let requests = server.received_requests().await.expect("recording enabled");
        let body = String::from_utf8_lossy(&requests[0].body).to_string();
        assert!(!body.contains("hmbridge-rf"));
    }

    #[tokio::test]
    async fn unreachable_ccu_fails_register_but_not_unregister() {
        let session = session("http://127.0.0.1:9".to_string(), None);
        let client = RegistrationClient::new(vec![session]).expect("client");
        let err = client.register_all().await.expect_err("unreachable");
        assert!(matches!(err, RegistrationError::Request { .. }));
        client.unregister_all().await;
    }
}
