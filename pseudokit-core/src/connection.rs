use std::time::Duration;

use reqwest::{Method, RequestBuilder, Url};
use serde::Serialize;
use tracing::debug;

use crate::{
    error::PseudokitError,
    http::{ApiResponse, HttpClient, DEFAULT_TIMEOUT},
    session::Session,
    token::ListedToken,
};

/// Header carrying the static API credential on every request.
const API_KEY_HEADER: &str = "apiKey";
/// Header carrying the protocol version on every request.
const API_VERSION_HEADER: &str = "apiVersion";
/// Protocol version spoken by this client.
const API_VERSION: &str = "2.0";

/// Access to one pseudonymization service instance, authenticated by a
/// static API key.
///
/// A connection provides the two protocol operations that do not belong to
/// any single session (creating a brand-new [`Session`] and reconstructing
/// one from a known session id) plus the authenticated request plumbing the
/// sessions run on. Connection operations carry no shared mutable state and
/// may run concurrently without coordination; clones share the underlying
/// connection pool.
#[derive(Debug, Clone)]
pub struct Connection {
    base_url: String,
    api_key: String,
    http: HttpClient,
}

impl Connection {
    /// Creates a connection to the service at `base_url`, authenticating
    /// every request with `api_key`. `timeout` bounds each request; expiry
    /// surfaces as a [`PseudokitError::NetworkError`]. The default deadline
    /// is 5 seconds.
    ///
    /// # Errors
    /// Returns [`PseudokitError::InvalidArgument`] if `base_url` is not a
    /// valid absolute URL.
    pub fn new(
        base_url: &str,
        api_key: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, PseudokitError> {
        Url::parse(base_url).map_err(|err| PseudokitError::InvalidArgument {
            attribute: "base_url".to_string(),
            reason: format!("not a valid URL: {err}"),
        })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: HttpClient::new(timeout.unwrap_or(DEFAULT_TIMEOUT)),
        })
    }

    /// Base URL of the service instance this connection talks to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Creates a new session on the service.
    ///
    /// # Errors
    /// Any status other than 201 is a [`PseudokitError::NetworkError`]; a
    /// 201 whose body carries no session id is a
    /// [`PseudokitError::ProtocolViolation`].
    pub async fn create_session(&self) -> Result<Session, PseudokitError> {
        let response = self.post_empty("sessions").await?;
        if response.status() != 201 {
            return Err(response.into_network_error());
        }
        let body: serde_json::Value = response.json()?;
        let session_id = body
            .get("sessionId")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| PseudokitError::ProtocolViolation {
                url: response.url().to_string(),
                error: "session creation response carries no session id".to_string(),
            })?;
        debug!(session_id, "session created");
        Ok(Session::new(session_id.to_string(), self.clone()))
    }

    /// Reconstructs a session from a known session id by listing its live
    /// tokens and rebuilding the temp-id cache from them.
    ///
    /// Useful when the calling application persisted a session id across a
    /// restart: the session object itself cannot be persisted, but the
    /// service's token list is authoritative and the cache is rebuilt from
    /// it.
    ///
    /// # Errors
    /// [`PseudokitError::InvalidSession`] if no session with this id exists;
    /// [`PseudokitError::NetworkError`] on transport failure or unexpected
    /// statuses.
    pub async fn read_session(&self, session_id: &str) -> Result<Session, PseudokitError> {
        let response = self.get(&format!("sessions/{session_id}/tokens/")).await?;
        match response.status() {
            404 => Err(PseudokitError::InvalidSession),
            // No content: the session exists but holds no tokens.
            204 => Ok(Session::new(session_id.to_string(), self.clone())),
            200 => {
                let tokens: Vec<ListedToken> = response.json()?;
                let session = Session::new(session_id.to_string(), self.clone());
                session.reconcile(&tokens).await;
                debug!(session_id, tokens = tokens.len(), "session restored");
                Ok(session)
            }
            _ => Err(response.into_network_error()),
        }
    }

    /// Checks whether a token is still registered on the service.
    ///
    /// # Errors
    /// Returns [`PseudokitError::NetworkError`] if the transport fails.
    pub async fn check_token_valid(&self, token_id: &str) -> Result<bool, PseudokitError> {
        let response = self
            .get(&format!("validate/token?tokenId={token_id}"))
            .await?;
        Ok(response.is_success())
    }

    fn authed(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{path}", self.base_url);
        self.http
            .req(method, &url)
            .header(API_KEY_HEADER, self.api_key.as_str())
            .header(API_VERSION_HEADER, API_VERSION)
            .header("Accept", "application/json")
    }

    pub(crate) async fn get(&self, path: &str) -> Result<ApiResponse, PseudokitError> {
        self.http.handle(self.authed(Method::GET, path)).await
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<ApiResponse, PseudokitError> {
        self.http.handle(self.authed(Method::DELETE, path)).await
    }

    pub(crate) async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse, PseudokitError> {
        self.http
            .handle(self.authed(Method::POST, path).json(body))
            .await
    }

    async fn post_empty(&self, path: &str) -> Result<ApiResponse, PseudokitError> {
        self.http.handle(self.authed(Method::POST, path)).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::PatientId;

    fn connection(server: &mockito::Server) -> Connection {
        Connection::new(&server.url(), "test-key", None).unwrap()
    }

    #[test]
    fn rejects_invalid_base_url() {
        let result = Connection::new("not a url", "key", None);
        assert!(matches!(
            result,
            Err(PseudokitError::InvalidArgument { attribute, .. }) if attribute == "base_url"
        ));
    }

    #[tokio::test]
    async fn create_session_authenticates_and_parses_the_session_id() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/sessions")
            .match_header(API_KEY_HEADER, "test-key")
            .match_header(API_VERSION_HEADER, API_VERSION)
            .with_status(201)
            .with_body(r#"{"sessionId": "s1", "uri": "https://example.org/sessions/s1/"}"#)
            .create_async()
            .await;

        let session = connection(&server).create_session().await.unwrap();
        mock.assert_async().await;
        assert_eq!(session.id(), "s1");
    }

    #[tokio::test]
    async fn create_session_surfaces_unexpected_statuses() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sessions")
            .with_status(401)
            .with_body("bad api key")
            .create_async()
            .await;

        let result = connection(&server).create_session().await;
        match result.unwrap_err() {
            PseudokitError::NetworkError { status, error, .. } => {
                assert_eq!(status, Some(401));
                assert_eq!(error, "bad api key");
            }
            other => panic!("expected NetworkError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_session_without_a_session_id_is_a_protocol_violation() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sessions")
            .with_status(201)
            .with_body(r#"{"uri": "https://example.org/sessions/s1/"}"#)
            .create_async()
            .await;

        let result = connection(&server).create_session().await;
        assert!(matches!(
            result,
            Err(PseudokitError::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn create_session_with_an_unparseable_body_is_a_network_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/sessions")
            .with_status(201)
            .with_body("<html>not json</html>")
            .create_async()
            .await;

        let result = connection(&server).create_session().await;
        assert!(matches!(result, Err(PseudokitError::NetworkError { .. })));
    }

    #[tokio::test]
    async fn read_session_distinguishes_missing_from_empty_sessions() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions/gone/tokens/")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/sessions/empty/tokens/")
            .with_status(204)
            .create_async()
            .await;

        let connection = connection(&server);
        assert!(matches!(
            connection.read_session("gone").await,
            Err(PseudokitError::InvalidSession)
        ));

        let session = connection.read_session("empty").await.unwrap();
        assert_eq!(session.id(), "empty");
        assert!(session.temp_ids().await.is_empty());
    }

    #[tokio::test]
    async fn read_session_rebuilds_the_cache_from_the_token_listing() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sessions/s1/tokens/")
            .with_status(200)
            .with_body(
                json!([
                    {
                        "id": "t1",
                        "type": "readPatients",
                        "data": {"searchIds": [{"idType": "intid", "idString": "42"}]}
                    },
                    {
                        "id": "t2",
                        "type": "readPatients",
                        "data": {"searchIds": [
                            {"idType": "intid", "idString": "1"},
                            {"idType": "intid", "idString": "2"}
                        ]}
                    },
                    {"id": "t3", "type": "addPatient", "data": {}}
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let session = connection(&server).read_session("s1").await.unwrap();
        let patient = PatientId::new("intid", "42").unwrap();
        assert_eq!(session.get_id("t1").await, Some(patient));
        assert_eq!(session.get_id("t2").await, None);
        assert_eq!(session.get_id("t3").await, None);
        assert_eq!(session.temp_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn check_token_valid_maps_statuses_to_booleans() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/validate/token?tokenId=alive")
            .with_status(200)
            .create_async()
            .await;
        server
            .mock("GET", "/validate/token?tokenId=dead")
            .with_status(404)
            .create_async()
            .await;

        let connection = connection(&server);
        assert!(connection.check_token_valid("alive").await.unwrap());
        assert!(!connection.check_token_valid("dead").await.unwrap());
    }
}
