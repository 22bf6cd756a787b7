// src/server/session.rs
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::error::PairError;
use crate::server::locale::LocalePolicy;
use crate::server::page::{BuiltinPages, PageRenderer};
use crate::token::SessionToken;

const MAX_BODY_BYTES: u64 = 16 * 1024;
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

// Session phases. Only `start` moves CLOSED back to OPEN, so connections
// that outlive `stop` never see an admissible session.
const OPEN: u8 = 0;
const USED: u8 = 1;
const CLOSED: u8 = 2;

/// Receives the trimmed key after the one successful submission.
pub type KeyCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct SessionOptions {
    pub pages: Arc<dyn PageRenderer>,
    pub locale: LocalePolicy,
    pub stop_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            pages: Arc::new(BuiltinPages),
            locale: LocalePolicy::default(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    key: String,
}

#[derive(Debug, Serialize)]
struct SubmitReply<'a> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// What a submission did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    Accepted,
    EmptyKey,
    Malformed(String),
    NotFound,
}

impl SubmitOutcome {
    fn into_response(self) -> Response {
        match self {
            SubmitOutcome::Accepted => json_reply(StatusCode::OK, None),
            SubmitOutcome::EmptyKey => json_reply(StatusCode::BAD_REQUEST, Some("empty_key")),
            SubmitOutcome::Malformed(detail) => {
                json_reply(StatusCode::INTERNAL_SERVER_ERROR, Some(detail.as_str()))
            }
            SubmitOutcome::NotFound => not_found(),
        }
    }
}

fn json_reply(status: StatusCode, error: Option<&str>) -> Response {
    let body = SubmitReply { ok: error.is_none(), error };
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn not_found() -> Response {
    warp::reply::with_status("Not found", StatusCode::NOT_FOUND).into_response()
}

pub(crate) struct SessionState {
    token: SessionToken,
    phase: AtomicU8,
    on_key: KeyCallback,
    pages: Arc<dyn PageRenderer>,
    locale: LocalePolicy,
}

impl SessionState {
    pub(crate) fn new(token: SessionToken, on_key: KeyCallback, options: &SessionOptions) -> Self {
        Self {
            token,
            phase: AtomicU8::new(OPEN),
            on_key,
            pages: options.pages.clone(),
            locale: options.locale,
        }
    }

    fn admits(&self, token: &str) -> bool {
        self.phase.load(Ordering::Acquire) == OPEN && self.token.as_str() == token
    }

    fn is_consumed(&self) -> bool {
        self.phase.load(Ordering::Acquire) == USED
    }

    fn close(&self) {
        self.phase.store(CLOSED, Ordering::Release);
    }

    fn reopen(&self) {
        let _ = self
            .phase
            .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire);
    }

    fn submit_url(&self) -> String {
        format!("/api/session/{}/submit", self.token)
    }

    pub(crate) fn page(&self, token: &str, accept_language: Option<&str>) -> Response {
        if !self.admits(token) {
            return not_found();
        }
        let locale = self.locale.choose(accept_language);
        warp::reply::html(self.pages.render(locale, &self.submit_url())).into_response()
    }

    pub(crate) fn submit(&self, token: &str, body: &[u8]) -> SubmitOutcome {
        if !self.admits(token) {
            return SubmitOutcome::NotFound;
        }

        let request: SubmitRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => {
                warn!("malformed submission for session {}: {e}", self.token.fingerprint());
                return SubmitOutcome::Malformed(e.to_string());
            }
        };

        let key = request.key.trim();
        if key.is_empty() {
            debug!("empty key submitted for session {}", self.token.fingerprint());
            return SubmitOutcome::EmptyKey;
        }

        if self
            .phase
            .compare_exchange(OPEN, USED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("session {} already consumed or closed", self.token.fingerprint());
            return SubmitOutcome::NotFound;
        }

        info!(
            "key received for session {} ({} chars)",
            self.token.fingerprint(),
            key.chars().count()
        );
        (self.on_key)(key.to_owned());
        SubmitOutcome::Accepted
    }
}

pub(crate) fn routes(
    state: Arc<SessionState>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone + Send + Sync + 'static {
    let with_state = warp::any().map(move || state.clone());

    // GET /session/{token}
    let page = warp::get()
        .and(warp::path!("session" / String))
        .and(warp::header::optional::<String>("accept-language"))
        .and(with_state.clone())
        .map(|token: String, lang: Option<String>, state: Arc<SessionState>| {
            state.page(&token, lang.as_deref())
        });

    // POST /api/session/{token}/submit
    let submit = warp::post()
        .and(warp::path!("api" / "session" / String / "submit"))
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_state)
        .map(|token: String, body: Bytes, state: Arc<SessionState>| {
            state.submit(&token, &body).into_response()
        });

    page.or(submit)
        .unify()
        .recover(reject_as_not_found)
        .unify()
        .with(warp::log("tv_pair::http"))
}

async fn reject_as_not_found(rejection: Rejection) -> Result<Response, Infallible> {
    debug!("rejected request: {rejection:?}");
    Ok(not_found())
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// The HTTP endpoint for one pairing attempt.
///
/// Idle until [`start`](Self::start), consumed after the first accepted key,
/// inert once [`stop`](Self::stop)ped.
pub struct SessionServer {
    state: Arc<SessionState>,
    stop_grace: Duration,
    running: Option<Running>,
}

impl SessionServer {
    pub fn new(token: SessionToken, on_key: KeyCallback, options: SessionOptions) -> Self {
        Self {
            state: Arc::new(SessionState::new(token, on_key, &options)),
            stop_grace: options.stop_grace,
            running: None,
        }
    }

    pub fn token(&self) -> &SessionToken {
        &self.state.token
    }

    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.addr.port())
    }

    pub fn is_listening(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_consumed(&self) -> bool {
        self.state.is_consumed()
    }

    /// Binds `ip:port` (0 for an ephemeral port) and starts serving.
    /// Returns the port actually bound.
    pub async fn start(&mut self, ip: IpAddr, port: u16) -> Result<u16, PairError> {
        if let Some(running) = &self.running {
            return Ok(running.addr.port());
        }

        let listener = TcpListener::bind((ip, port)).await.map_err(PairError::from_bind)?;
        let addr = listener
            .local_addr()
            .map_err(|e| PairError::ServerStartFailure(e.to_string()))?;
        if addr.port() == 0 {
            return Err(PairError::PortBindConflict(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "platform reported port 0",
            )));
        }

        self.state.reopen();
        let shutdown = CancellationToken::new();
        let signal = {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        };

        let server = warp::serve(routes(self.state.clone()))
            .serve_incoming_with_graceful_shutdown(TcpListenerStream::new(listener), signal);
        let task = tokio::spawn(server);

        info!(
            "pairing session {} listening on {addr}",
            self.state.token.fingerprint()
        );
        self.running = Some(Running { addr, shutdown, task });
        Ok(addr.port())
    }

    /// Closes the listener and clears the consumed state. Requests still in
    /// flight on old connections are answered 404. Safe to call in any state.
    pub async fn stop(&mut self) {
        self.state.close();
        if let Some(Running { addr, shutdown, mut task }) = self.running.take() {
            shutdown.cancel();
            if tokio::time::timeout(self.stop_grace, &mut task).await.is_err() {
                warn!("pairing server on {addr} did not drain in time, aborting");
                task.abort();
                let _ = task.await;
            }
            info!("pairing session {} stopped", self.state.token.fingerprint());
        }
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        self.state.close();
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
            running.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::locale::Locale;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        keys: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    fn session(token: &SessionToken) -> (Arc<SessionState>, Arc<Recorder>) {
        session_with(token, SessionOptions::default())
    }

    fn session_with(token: &SessionToken, options: SessionOptions) -> (Arc<SessionState>, Arc<Recorder>) {
        let (on_key, recorder) = recording();
        (Arc::new(SessionState::new(token.clone(), on_key, &options)), recorder)
    }

    fn submit_path(token: &SessionToken) -> String {
        format!("/api/session/{token}/submit")
    }

    async fn post(state: &Arc<SessionState>, path: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let res = warp::test::request()
            .method("POST")
            .path(path)
            .header("content-type", "application/json")
            .body(body.to_owned())
            .reply(&routes(state.clone()))
            .await;
        let json = serde_json::from_slice(res.body()).unwrap_or(serde_json::Value::Null);
        (res.status(), json)
    }

    async fn get(state: &Arc<SessionState>, path: &str) -> StatusCode {
        warp::test::request()
            .method("GET")
            .path(path)
            .reply(&routes(state.clone()))
            .await
            .status()
    }

    #[tokio::test]
    async fn serves_page_for_own_token() {
        let token = SessionToken::generate();
        let (state, _) = session(&token);

        let res = warp::test::request()
            .path(&format!("/session/{token}"))
            .reply(&routes(state))
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let html = std::str::from_utf8(res.body()).unwrap();
        assert!(html.contains(&submit_path(&token)));
    }

    #[tokio::test]
    async fn other_tokens_are_not_found() {
        let t1 = SessionToken::generate();
        let t2 = SessionToken::generate();
        let (state, recorder) = session(&t1);

        assert_eq!(get(&state, &format!("/session/{t2}")).await, StatusCode::NOT_FOUND);
        let (status, _) = post(&state, &submit_path(&t2), r#"{"key":"abc"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
        assert!(!state.is_consumed());
    }

    #[tokio::test]
    async fn unknown_routes_and_methods_are_not_found() {
        let token = SessionToken::generate();
        let (state, _) = session(&token);

        assert_eq!(get(&state, "/").await, StatusCode::NOT_FOUND);
        assert_eq!(get(&state, &submit_path(&token)).await, StatusCode::NOT_FOUND);
        let (status, _) = post(&state, &format!("/session/{token}"), "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let res = warp::test::request()
            .method("DELETE")
            .path(&format!("/session/{token}"))
            .reply(&routes(state))
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn valid_key_is_accepted_once() {
        let token = SessionToken::generate();
        let (state, recorder) = session(&token);

        let (status, body) = post(&state, &submit_path(&token), r#"{"key":"abc123"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"ok": true}));
        assert_eq!(*recorder.keys.lock().unwrap(), vec!["abc123".to_string()]);

        let (status, _) = post(&state, &submit_path(&token), r#"{"key":"other"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(get(&state, &format!("/session/{token}")).await, StatusCode::NOT_FOUND);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn key_is_trimmed() {
        let token = SessionToken::generate();
        let (state, recorder) = session(&token);

        let (status, _) = post(&state, &submit_path(&token), r#"{ "key" : "  ss://abc \n" }"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(*recorder.keys.lock().unwrap(), vec!["ss://abc".to_string()]);
    }

    #[tokio::test]
    async fn blank_key_keeps_session_open() {
        let token = SessionToken::generate();
        let (state, recorder) = session(&token);

        for body in [r#"{"key":""}"#, r#"{"key":"   "}"#, r#"{"key":"\t"}"#] {
            let (status, json) = post(&state, &submit_path(&token), body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json, serde_json::json!({"ok": false, "error": "empty_key"}));
        }
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(get(&state, &format!("/session/{token}")).await, StatusCode::OK);

        let (status, _) = post(&state, &submit_path(&token), r#"{"key":"abc"}"#).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_body_is_a_server_error() {
        let token = SessionToken::generate();
        let (state, recorder) = session(&token);

        for body in ["not json", r#"{"key": 5}"#, r#"{"nokey":"x"}"#, r#"{"key":null}"#] {
            let (status, json) = post(&state, &submit_path(&token), body).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "body {body}");
            assert_eq!(json["ok"], false);
            assert!(!json["error"].as_str().unwrap_or_default().is_empty());
        }
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
        assert!(!state.is_consumed());
    }

    #[tokio::test]
    async fn escaped_quotes_survive_parsing() {
        let token = SessionToken::generate();
        let (state, recorder) = session(&token);

        let (status, _) = post(&state, &submit_path(&token), r#"{"key":"a\"b","extra":{"key":"no"}}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(*recorder.keys.lock().unwrap(), vec!["a\"b".to_string()]);
    }

    #[tokio::test]
    async fn concurrent_posts_have_one_winner() {
        let token = SessionToken::generate();
        let (state, recorder) = session(&token);
        let path = submit_path(&token);

        let ((s1, b1), (s2, b2)) = futures::join!(
            post(&state, &path, r#"{"key":"k1"}"#),
            post(&state, &path, r#"{"key":"k2"}"#),
        );

        let oks = [(s1, &b1), (s2, &b2)]
            .iter()
            .filter(|(s, b)| *s == StatusCode::OK && **b == serde_json::json!({"ok": true}))
            .count();
        assert_eq!(oks, 1);
        assert!(s1 == StatusCode::NOT_FOUND || s2 == StatusCode::NOT_FOUND);

        let keys = recorder.keys.lock().unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0] == "k1" || keys[0] == "k2");
    }

    #[test]
    fn racing_threads_invoke_callback_once() {
        let token = SessionToken::generate();
        let (state, recorder) = session(&token);

        let outcomes: Vec<SubmitOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let state = &state;
                    let token = &token;
                    s.spawn(move || {
                        let body = format!(r#"{{"key":"k{i}"}}"#);
                        state.submit(token.as_str(), body.as_bytes())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let accepted = outcomes.iter().filter(|o| **o == SubmitOutcome::Accepted).count();
        assert_eq!(accepted, 1);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, SubmitOutcome::Accepted | SubmitOutcome::NotFound)));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn page_language_follows_policy() {
        let token = SessionToken::generate();
        let options = SessionOptions {
            locale: LocalePolicy { default: Locale::En, prefer_client: true },
            ..SessionOptions::default()
        };
        let (state, _) = session_with(&token, options);

        let res = warp::test::request()
            .path(&format!("/session/{token}"))
            .header("accept-language", "ru-RU,ru;q=0.9")
            .reply(&routes(state.clone()))
            .await;
        assert!(std::str::from_utf8(res.body()).unwrap().contains(r#"lang="ru""#));

        let res = warp::test::request()
            .path(&format!("/session/{token}"))
            .header("accept-language", "fr")
            .reply(&routes(state))
            .await;
        assert!(std::str::from_utf8(res.body()).unwrap().contains(r#"lang="en""#));
    }

    fn noop() -> KeyCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn start_reports_bound_port_and_stop_is_idempotent() {
        let mut server = SessionServer::new(SessionToken::generate(), noop(), SessionOptions::default());
        server.stop().await;

        let port = server.start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();
        assert!(port > 0);
        assert_eq!(server.port(), Some(port));
        assert!(server.is_listening());
        assert_eq!(server.start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap(), port);

        server.stop().await;
        assert!(!server.is_listening());
        assert_eq!(server.port(), None);
        server.stop().await;

        // port is free again
        let rebound = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port));
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn occupied_port_is_a_bind_conflict() {
        let occupied = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut server = SessionServer::new(SessionToken::generate(), noop(), SessionOptions::default());
        let err = server.start(IpAddr::V4(Ipv4Addr::LOCALHOST), port).await.unwrap_err();
        assert!(matches!(err, PairError::PortBindConflict(_)));
        assert!(!server.is_listening());
    }

    #[tokio::test]
    async fn stop_clears_consumed_state() {
        let token = SessionToken::generate();
        let mut server = SessionServer::new(token.clone(), noop(), SessionOptions::default());
        server.start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();

        let outcome = server.state.submit(token.as_str(), br#"{"key":"abc"}"#);
        assert_eq!(outcome, SubmitOutcome::Accepted);
        assert!(server.is_consumed());

        server.stop().await;
        assert!(!server.is_consumed());
    }

    fn recording() -> (KeyCallback, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let on_key: KeyCallback = {
            let recorder = recorder.clone();
            Arc::new(move |key| {
                recorder.calls.fetch_add(1, Ordering::SeqCst);
                recorder.keys.lock().unwrap().push(key);
            })
        };
        (on_key, recorder)
    }

    #[tokio::test]
    async fn stopped_session_rejects_late_requests() {
        let token = SessionToken::generate();
        let (on_key, recorder) = recording();
        let mut server = SessionServer::new(token.clone(), on_key, SessionOptions::default());
        server.start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();

        // what a surviving connection task holds on to
        let conn = server.state.clone();
        assert_eq!(conn.submit(token.as_str(), br#"{"key":"k1"}"#), SubmitOutcome::Accepted);

        server.stop().await;
        assert_eq!(conn.submit(token.as_str(), br#"{"key":"k2"}"#), SubmitOutcome::NotFound);
        assert_eq!(get(&conn, &format!("/session/{token}")).await, StatusCode::NOT_FOUND);
        assert_eq!(*recorder.keys.lock().unwrap(), vec!["k1".to_string()]);
    }

    #[tokio::test]
    async fn restarting_reopens_a_stopped_session() {
        let token = SessionToken::generate();
        let (on_key, recorder) = recording();
        let mut server = SessionServer::new(token.clone(), on_key, SessionOptions::default());
        server.start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();
        server.stop().await;

        server.start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();
        assert_eq!(server.state.submit(token.as_str(), br#"{"key":"k"}"#), SubmitOutcome::Accepted);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        server.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_in_flight_during_stop_is_not_accepted() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let token = SessionToken::generate();
        let (on_key, recorder) = recording();
        let options = SessionOptions {
            stop_grace: Duration::from_millis(200),
            ..SessionOptions::default()
        };
        let mut server = SessionServer::new(token.clone(), on_key, options);
        let port = server.start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await.unwrap();
        let path = submit_path(&token);

        let slow_body = r#"{"key":"k2"}"#;
        let mut slow = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let head = format!(
            "POST {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{{\"key\":",
            slow_body.len()
        );
        slow.write_all(head.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fast_body = r#"{"key":"k1"}"#;
        let mut fast = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{fast_body}",
            fast_body.len()
        );
        fast.write_all(request.as_bytes()).await.unwrap();
        let mut reply = String::new();
        fast.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");

        server.stop().await;
        assert!(!server.is_listening());

        // finish the body on the connection that outlived the listener
        let _ = slow.write_all(br#""k2"}"#).await;
        let mut late = String::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), slow.read_to_string(&mut late)).await;
        assert!(!late.starts_with("HTTP/1.1 200"), "{late}");

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.keys.lock().unwrap(), vec!["k1".to_string()]);
    }
}
