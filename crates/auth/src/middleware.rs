use std::{collections::HashMap, sync::Arc};

use {
    axum::{
        extract::{
            FromRequestParts, Query, Request, State,
            ws::{CloseFrame, Message, WebSocketUpgrade, close_code},
        },
        http::{Method, StatusCode, Uri},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    regex::Regex,
    serde::de::DeserializeOwned,
    tracing::{debug, warn},
};

use crate::{cache::ChannelCache, channel::Channel, error::AuthFailure, keys::parse_public_key_hex};

pub const PUBLIC_KEY_PARAM: &str = "publicKey";
pub const ENCRYPTED_MESSAGE_PARAM: &str = "encryptedMessage";

/// Maximum websocket close reason length (RFC 6455 §5.5: 125-byte control payload minus the code).
const MAX_CLOSE_REASON: usize = 123;

/// How a guarded route answers, chosen when the route is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Ordinary HTTP response: failures become `401 Unauthorized`.
    Plain,
    /// WebSocket upgrade: failures open the socket and close it with a protocol error.
    Stream,
}

/// Attached to every request that passed the gate.
#[derive(Debug, Clone)]
pub struct AuthenticatedRequest {
    pub channel: Arc<Channel>,
    pub plaintext: Vec<u8>,
}

impl AuthenticatedRequest {
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.plaintext)
    }
}

/// The authentication gate: exclusions plus the channel cache.
pub struct AuthGate {
    cache: ChannelCache,
    exclude_routes: Vec<Regex>,
    exclude_methods: Vec<Method>,
}

impl AuthGate {
    /// `exclude_routes` are full-match regexes on the path; `exclude_methods` match exactly.
    pub fn new(
        cache: ChannelCache,
        exclude_routes: &[String],
        exclude_methods: &[String],
    ) -> Result<Self, regex::Error> {
        let exclude_routes = exclude_routes
            .iter()
            .map(|p| Regex::new(&format!("^(?:{p})$")))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude_methods = exclude_methods
            .iter()
            .filter_map(|m| match Method::from_bytes(m.to_ascii_uppercase().as_bytes()) {
                Ok(method) => Some(method),
                Err(e) => {
                    warn!(method = %m, error = %e, "ignoring invalid excluded method");
                    None
                },
            })
            .collect();
        Ok(Self {
            cache,
            exclude_routes,
            exclude_methods,
        })
    }

    pub fn cache(&self) -> &ChannelCache {
        &self.cache
    }

    pub fn is_excluded(&self, method: &Method, path: &str) -> bool {
        self.exclude_methods.contains(method) || self.is_path_excluded(path)
    }

    pub fn is_path_excluded(&self, path: &str) -> bool {
        self.exclude_routes.iter().any(|r| r.is_match(path))
    }

    /// Resolve the caller's channel and open `encryptedMessage` from the query string.
    pub fn open_request(&self, uri: &Uri) -> Result<AuthenticatedRequest, AuthFailure> {
        let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri)
            .map_err(|e| AuthFailure::DecryptionFailed(format!("unreadable query: {e}")))?;

        let public_key = params
            .get(PUBLIC_KEY_PARAM)
            .ok_or(AuthFailure::MissingField(PUBLIC_KEY_PARAM))?;
        let encrypted = params
            .get(ENCRYPTED_MESSAGE_PARAM)
            .ok_or(AuthFailure::MissingField(ENCRYPTED_MESSAGE_PARAM))?;
        debug!(public_key = %public_key, "retrieved publicKey and encryptedMessage");

        let peer = parse_public_key_hex(public_key)?;
        let channel = self.cache.get_or_create(&peer);
        let plaintext = channel.open(encrypted)?;
        debug!(peer = %channel.peer_hex(), bytes = plaintext.len(), "message decrypted");

        Ok(AuthenticatedRequest { channel, plaintext })
    }
}

/// Axum middleware guarding one route. Install with
/// `middleware::from_fn_with_state((gate, shape), authenticate)`.
pub async fn authenticate(
    State((gate, shape)): State<(Arc<AuthGate>, ResponseShape)>,
    mut req: Request,
    next: Next,
) -> Response {
    if gate.is_excluded(req.method(), req.uri().path()) {
        return next.run(req).await;
    }

    match gate.open_request(req.uri()) {
        Ok(auth) => {
            req.extensions_mut().insert(auth);
            next.run(req).await
        },
        Err(failure) => {
            debug!(path = %req.uri().path(), error = %failure, ?shape, "authentication failed");
            reject(req, shape, &failure).await
        },
    }
}

async fn reject(req: Request, shape: ResponseShape, failure: &AuthFailure) -> Response {
    let diagnostic = failure.diagnostic();
    if shape == ResponseShape::Plain {
        return unauthorized(diagnostic);
    }

    let (mut parts, _body) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => {
            let reason = close_reason(&diagnostic);
            ws.on_upgrade(move |mut socket| async move {
                let frame = CloseFrame {
                    code: close_code::PROTOCOL,
                    reason: reason.into(),
                };
                if let Err(e) = socket.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "failed to send auth close frame");
                }
            })
        },
        Err(rejection) => {
            debug!(error = %rejection, "stream route called without upgrade");
            unauthorized(diagnostic)
        },
    }
}

fn unauthorized(body: String) -> Response {
    (StatusCode::UNAUTHORIZED, body).into_response()
}

/// Truncate to the close-frame limit on a char boundary.
pub(crate) fn close_reason(diagnostic: &str) -> String {
    if diagnostic.len() <= MAX_CLOSE_REASON {
        return diagnostic.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !diagnostic.is_char_boundary(end) {
        end -= 1;
    }
    diagnostic[..end].to_string()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::keys::ServerKeys,
        axum::{
            Extension, Router,
            body::Body,
            middleware,
            routing::{get, post},
        },
        std::sync::atomic::{AtomicUsize, Ordering},
        tower::ServiceExt,
    };

    struct Fixture {
        keys: ServerKeys,
        gate: Arc<AuthGate>,
        calls: Arc<AtomicUsize>,
    }

    fn fixture(exclude_methods: &[&str]) -> Fixture {
        let keys = ServerKeys::generate();
        let cache = ChannelCache::new(keys.secret().clone(), 16, None);
        let methods: Vec<String> = exclude_methods.iter().map(|m| m.to_string()).collect();
        let gate = AuthGate::new(cache, &["/getpublickey".into()], &methods).unwrap();
        Fixture {
            keys,
            gate: Arc::new(gate),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn app(fx: &Fixture, shape: ResponseShape) -> Router {
        let echo_calls = Arc::clone(&fx.calls);
        let key_calls = Arc::clone(&fx.calls);
        let ping_calls = Arc::clone(&fx.calls);
        Router::new()
            .route(
                "/protocol",
                get(move |Extension(auth): Extension<AuthenticatedRequest>| {
                    let calls = Arc::clone(&echo_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        String::from_utf8_lossy(&auth.plaintext).into_owned()
                    }
                }),
            )
            .route(
                "/getpublickey",
                get(move || {
                    let calls = Arc::clone(&key_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        "key"
                    }
                }),
            )
            .route(
                "/ping",
                post(move || {
                    let calls = Arc::clone(&ping_calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        "pong"
                    }
                }),
            )
            .route_layer(middleware::from_fn_with_state(
                (Arc::clone(&fx.gate), shape),
                authenticate,
            ))
    }

    fn encode_query(value: &str) -> String {
        value.replace('+', "%2B").replace('/', "%2F").replace('=', "%3D")
    }

    fn sealed_uri(fx: &Fixture, path: &str, client: &crypto_box::SecretKey, body: &[u8]) -> String {
        let channel = Channel::new(client, fx.keys.public_key());
        format!(
            "{path}?publicKey={}&encryptedMessage={}",
            hex::encode(client.public_key().as_bytes()),
            encode_query(&channel.seal(body).unwrap())
        )
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, String) {
        let req = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn client_key() -> crypto_box::SecretKey {
        crypto_box::SecretKey::generate(&mut crypto_box::aead::OsRng)
    }

    #[tokio::test]
    async fn valid_message_reaches_handler() {
        let fx = fixture(&[]);
        let uri = sealed_uri(&fx, "/protocol", &client_key(), br#"{"messageOne":"testOne"}"#);

        let (status, body) = call(app(&fx, ResponseShape::Plain), Method::GET, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"messageOne":"testOne"}"#);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.gate.cache().len(), 1);
    }

    #[tokio::test]
    async fn missing_parameters_are_unauthorized() {
        let fx = fixture(&[]);
        let (status, body) = call(app(&fx, ResponseShape::Plain), Method::GET, "/protocol").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains(PUBLIC_KEY_PARAM));

        let client = client_key();
        let uri = format!("/protocol?publicKey={}", hex::encode(client.public_key().as_bytes()));
        let (status, body) = call(app(&fx, ResponseShape::Plain), Method::GET, &uri).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains(ENCRYPTED_MESSAGE_PARAM));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_key_is_unauthorized() {
        let fx = fixture(&[]);
        let (status, _) = call(
            app(&fx, ResponseShape::Plain),
            Method::GET,
            "/protocol?publicKey=nothex&encryptedMessage=AAAA",
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn message_sealed_for_another_key_is_unauthorized() {
        let fx = fixture(&[]);
        let other = fixture(&[]);
        let client = client_key();
        // Sealed against another server's key, so our channel cannot open it.
        let uri = sealed_uri(&other, "/protocol", &client, b"{}");

        let (status, body) = call(app(&fx, ResponseShape::Plain), Method::GET, &uri).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("decryption failed"));
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn excluded_route_bypasses_authentication() {
        let fx = fixture(&[]);
        let (status, body) = call(app(&fx, ResponseShape::Plain), Method::GET, "/getpublickey").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "key");
        assert!(fx.gate.cache().is_empty());
    }

    #[tokio::test]
    async fn excluded_method_bypasses_authentication() {
        let fx = fixture(&["post"]);
        let (status, body) = call(app(&fx, ResponseShape::Plain), Method::POST, "/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "pong");
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
        assert!(fx.gate.cache().is_empty());
    }

    #[tokio::test]
    async fn method_exclusion_is_exact() {
        let fx = fixture(&["get"]);
        let (status, _) = call(app(&fx, ResponseShape::Plain), Method::POST, "/ping").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_excluded_methods_are_skipped() {
        let keys = ServerKeys::generate();
        let cache = ChannelCache::new(keys.secret().clone(), 4, None);
        let methods = vec!["bad method".to_string(), "OPTIONS".to_string()];
        let gate = AuthGate::new(cache, &[], &methods).unwrap();
        assert_eq!(gate.exclude_methods, vec![Method::OPTIONS]);
        assert!(gate.is_excluded(&Method::OPTIONS, "/protocol"));
    }

    #[tokio::test]
    async fn stream_shape_without_upgrade_falls_back_to_unauthorized() {
        let fx = fixture(&[]);
        let (status, _) = call(app(&fx, ResponseShape::Stream), Method::GET, "/protocol").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exclusion_is_full_match() {
        let fx = fixture(&[]);
        assert!(fx.gate.is_excluded(&Method::GET, "/getpublickey"));
        assert!(!fx.gate.is_excluded(&Method::GET, "/getpublickey/extra"));
        assert!(!fx.gate.is_excluded(&Method::GET, "/x/getpublickey"));
    }

    #[test]
    fn close_reason_respects_frame_limit() {
        let long = "é".repeat(100);
        let reason = close_reason(&long);
        assert!(reason.len() <= MAX_CLOSE_REASON);
        assert!(reason.chars().all(|c| c == 'é'));
        assert_eq!(close_reason("short"), "short");
    }
}
