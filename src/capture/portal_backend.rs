//! Screenshot capture through xdg-desktop-portal
//!
//! The portal's `Screenshot` method does not return the image. It returns a
//! request handle (an object path) and later emits
//! `org.freedesktop.portal.Request.Response` on that path once the user has
//! finished interacting with the compositor's dialog. One exchange:
//!
//! 1. subscribe to `Response` signals (done once, when the bus is opened)
//! 2. call `Screenshot("", {handle_token, modal, interactive})`
//! 3. register a [`PendingRequest`] keyed on the handle's last path segment
//! 4. read signals until one matches, ignoring the rest
//! 5. response code `0` with a `uri` yields a file; anything else is a
//!    cancellation
//! 6. open the file (it may not be visible yet) and decode it
//!
//! The IPC layer sits behind [`PortalBus`]; [`ZbusPortalBus`] is the
//! session-bus implementation.

use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use zbus::{
    Connection, MatchRule, MessageStream, Proxy,
    message::Type as MessageType,
    zvariant::{OwnedObjectPath, OwnedValue, Value},
};

use crate::{
    capture::{
        CapturedImage,
        constants::{
            self, PORTAL_BUS_NAME, PORTAL_OBJECT_PATH, PORTAL_REQUEST_INTERFACE,
            PORTAL_RESPONSE_CANCELLED, PORTAL_RESPONSE_SUCCESS, PORTAL_SCREENSHOT_INTERFACE,
        },
        primitive::CapturePrimitive,
        wayland_monitors,
    },
    error::{CaptureError, CaptureResult},
    model::{CaptureToken, MonitorRect, Region},
};

/// Options of one `Screenshot` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub handle_token: CaptureToken,
    pub modal:        bool,
    /// Let the user pick an area before the shot is taken
    pub interactive:  bool,
}

impl PortalRequest {
    /// A modal request with a fresh token
    pub fn new(interactive: bool) -> Self {
        Self {
            handle_token: CaptureToken::generate(),
            modal: true,
            interactive,
        }
    }

    /// Asks the portal to let the user choose what to capture
    pub fn interactive() -> Self {
        Self::new(true)
    }
}

/// One value from the `results` dictionary of a `Response` signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultValue {
    Str(String),
    Bool(bool),
    U32(u32),
    /// Anything else, kept as its D-Bus signature
    Other(String),
}

impl From<&Value<'_>> for ResultValue {
    fn from(value: &Value<'_>) -> Self {
        match value {
            Value::Str(s) => ResultValue::Str(s.as_str().to_string()),
            Value::Bool(b) => ResultValue::Bool(*b),
            Value::U32(n) => ResultValue::U32(*n),
            other => ResultValue::Other(other.value_signature().to_string()),
        }
    }
}

/// A decoded `org.freedesktop.portal.Request.Response` signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSignal {
    /// Object path the signal was emitted on
    pub path:    String,
    pub code:    u32,
    pub results: HashMap<String, ResultValue>,
}

/// IPC operations needed to run the portal exchange
#[async_trait]
pub trait PortalBus: Send + Sync {
    /// Calls `Screenshot(parent_window, options)` and returns the request
    /// handle path
    async fn screenshot(&self, parent_window: &str, request: &PortalRequest) -> CaptureResult<String>;

    /// Waits for the next `Response` signal, whatever its path
    async fn next_response(&self) -> CaptureResult<ResponseSignal>;
}

/// [`PortalBus`] over the D-Bus session bus
pub struct ZbusPortalBus {
    proxy:     Proxy<'static>,
    /// Subscribed before any request is sent
    responses: Mutex<MessageStream>,
}

impl fmt::Debug for ZbusPortalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZbusPortalBus").finish_non_exhaustive()
    }
}

impl ZbusPortalBus {
    /// Connects to the session bus and subscribes to portal responses
    ///
    /// # Errors
    ///
    /// - [`CaptureError::BusUnavailable`] - no session bus, or the portal
    ///   proxy cannot be created
    pub async fn connect() -> CaptureResult<Self> {
        let unavailable = |e: zbus::Error| CaptureError::BusUnavailable {
            service: PORTAL_BUS_NAME.to_string(),
            reason:  e.to_string(),
        };

        let conn = Connection::session().await.map_err(unavailable)?;
        Self::with_connection(conn).await.map_err(unavailable)
    }

    /// Uses an existing connection
    pub async fn with_connection(conn: Connection) -> zbus::Result<Self> {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .interface(PORTAL_REQUEST_INTERFACE)?
            .member("Response")?
            .build();
        let responses = MessageStream::for_match_rule(rule, &conn, None).await?;

        let proxy = Proxy::new(
            &conn,
            PORTAL_BUS_NAME,
            PORTAL_OBJECT_PATH,
            PORTAL_SCREENSHOT_INTERFACE,
        )
        .await?;

        Ok(Self {
            proxy,
            responses: Mutex::new(responses),
        })
    }
}

#[async_trait]
impl PortalBus for ZbusPortalBus {
    async fn screenshot(&self, parent_window: &str, request: &PortalRequest) -> CaptureResult<String> {
        let mut options: HashMap<&str, Value<'_>> = HashMap::new();
        options.insert("handle_token", Value::from(request.handle_token.as_str()));
        options.insert("modal", Value::from(request.modal));
        options.insert("interactive", Value::from(request.interactive));

        let reply = self
            .proxy
            .call_method("Screenshot", &(parent_window, options))
            .await?;
        let handle: OwnedObjectPath = reply
            .body()
            .deserialize()
            .map_err(|e| CaptureError::protocol(format!("Screenshot reply is not an object path: {}", e)))?;

        Ok(handle.as_str().to_string())
    }

    async fn next_response(&self) -> CaptureResult<ResponseSignal> {
        let mut responses = self.responses.lock().await;
        let message = responses
            .next()
            .await
            .ok_or_else(|| CaptureError::protocol("D-Bus connection closed while waiting for Response"))??;

        let path = message
            .header()
            .path()
            .map(|path| path.as_str().to_string())
            .unwrap_or_default();
        let (code, results): (u32, HashMap<String, OwnedValue>) = message
            .body()
            .deserialize()
            .map_err(|e| CaptureError::protocol(format!("Malformed Response signal on {}: {}", path, e)))?;

        Ok(ResponseSignal {
            path,
            code,
            results: results
                .iter()
                .map(|(key, value)| (key.clone(), ResultValue::from(&**value)))
                .collect(),
        })
    }
}

/// An outstanding portal request waiting for its `Response`
///
/// Lives from the moment the handle is known until the response arrives, the
/// wait times out, or an error aborts the exchange.
#[derive(Debug)]
pub struct PendingRequest {
    token:  CaptureToken,
    handle: String,
    key:    String,
}

impl PendingRequest {
    /// Registers the handle returned by `Screenshot`
    ///
    /// # Errors
    ///
    /// - [`CaptureError::ProtocolViolation`] - the handle has no usable last
    ///   path segment
    pub fn register(token: CaptureToken, handle: impl Into<String>) -> CaptureResult<Self> {
        let handle = handle.into();
        let key = handle
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| CaptureError::protocol(format!("Portal returned an invalid request handle '{}'", handle)))?
            .to_string();

        if key != token.as_str() {
            tracing::debug!("Portal chose handle {} for token {}", handle, token);
        }

        Ok(Self { token, handle, key })
    }

    pub fn token(&self) -> &CaptureToken {
        &self.token
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Whether a signal emitted on `path` answers this request
    pub fn matches(&self, path: &str) -> bool {
        path.rsplit('/').next() == Some(self.key.as_str())
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        tracing::trace!("Released pending portal request {}", self.handle);
    }
}

/// Extracts the screenshot URI from a matched response
///
/// Returns `Ok(None)` for any cancellation: code 1 (user), code 2 (other),
/// or a success without `uri`.
///
/// # Errors
///
/// - [`CaptureError::ProtocolViolation`] - `uri` is present but not a string
pub fn response_uri(signal: &ResponseSignal) -> CaptureResult<Option<String>> {
    match signal.code {
        PORTAL_RESPONSE_SUCCESS => {}
        PORTAL_RESPONSE_CANCELLED => {
            tracing::info!("Portal screenshot cancelled by the user");
            return Ok(None);
        }
        code => {
            tracing::info!("Portal screenshot ended without a result (code {})", code);
            return Ok(None);
        }
    }

    match signal.results.get("uri") {
        None => {
            tracing::info!("Portal response carries no uri, treating as cancelled");
            Ok(None)
        }
        Some(ResultValue::Str(uri)) => Ok(Some(uri.clone())),
        Some(other) => Err(CaptureError::protocol(format!(
            "Expected uri of type 's', got {:?}",
            other
        ))),
    }
}

/// Converts a `file://` URI into a local path
///
/// # Errors
///
/// - [`CaptureError::ProtocolViolation`] - malformed URI or another scheme
pub fn uri_to_path(uri: &str) -> CaptureResult<PathBuf> {
    let url = url::Url::parse(uri).map_err(|e| CaptureError::protocol(format!("Malformed uri '{}': {}", uri, e)))?;
    if url.scheme() != "file" {
        return Err(CaptureError::protocol(format!("Unsupported uri scheme '{}'", url.scheme())));
    }
    url.to_file_path()
        .map_err(|()| CaptureError::protocol(format!("uri '{}' has no local path", uri)))
}

/// Calls `open` until the file exists, sleeping `backoff` between attempts
///
/// Only `NotFound` is retried; other I/O errors are returned at once.
///
/// # Errors
///
/// - [`CaptureError::FileUnavailable`] - still missing after `attempts` tries
/// - [`CaptureError::IoError`] - any other open failure
pub async fn open_with_retry<T, F>(path: &Path, attempts: u32, backoff: Duration, mut open: F) -> CaptureResult<T>
where
    F: FnMut(&Path) -> io::Result<T>,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match open(path) {
            Ok(value) => return Ok(value),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("{} not there yet (attempt {}/{})", path.display(), attempt, attempts);
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
            Err(e) => return Err(CaptureError::IoError(e)),
        }
    }

    Err(CaptureError::FileUnavailable {
        path: path.to_path_buf(),
        attempts,
    })
}

/// Runs portal exchanges, one at a time
pub struct PortalClient {
    bus:            Arc<dyn PortalBus>,
    exchange:       Mutex<()>,
    timeout:        Option<Duration>,
    retry_attempts: u32,
    retry_backoff:  Duration,
}

impl PortalClient {
    /// Creates a client with timeouts and retries from the environment
    pub fn new(bus: Arc<dyn PortalBus>) -> Self {
        Self {
            bus,
            exchange: Mutex::new(()),
            timeout: constants::portal_timeout(),
            retry_attempts: constants::file_retry_attempts(),
            retry_backoff: constants::file_retry_backoff(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// Requests a screenshot and waits for the user
    ///
    /// Returns `Ok(None)` when the user cancelled.
    pub async fn screenshot(&self, request: PortalRequest) -> CaptureResult<Option<CapturedImage>> {
        let _exchange = self.exchange.lock().await;

        tracing::debug!(
            "Portal Screenshot (token {}, interactive {})",
            request.handle_token,
            request.interactive
        );
        let handle = self.bus.screenshot("", &request).await?;
        let pending = PendingRequest::register(request.handle_token, handle)?;

        let signal = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.await_response(&pending))
                .await
                .map_err(|_| {
                    tracing::warn!("No portal response for {} within {:?}", pending.handle(), limit);
                    CaptureError::CaptureTimeout {
                        duration_ms: millis_saturating(limit),
                    }
                })??,
            None => self.await_response(&pending).await?,
        };
        drop(pending);

        let Some(uri) = response_uri(&signal)? else {
            return Ok(None);
        };
        let path = uri_to_path(&uri)?;
        tracing::debug!("Portal wrote screenshot to {}", path.display());

        let file = open_with_retry(&path, self.retry_attempts, self.retry_backoff, |p| std::fs::File::open(p)).await?;
        let image = tokio::task::spawn_blocking(move || CapturedImage::from_file(file))
            .await
            .map_err(|e| CaptureError::IoError(io::Error::other(e)))??;

        Ok(Some(image))
    }

    async fn await_response(&self, pending: &PendingRequest) -> CaptureResult<ResponseSignal> {
        loop {
            let signal = self.bus.next_response().await?;
            if pending.matches(&signal.path) {
                return Ok(signal);
            }
            tracing::debug!("Ignoring Response on {} while waiting for {}", signal.path, pending.handle());
        }
    }
}

fn millis_saturating(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Wayland backend for any desktop with xdg-desktop-portal
pub struct PortalBackend {
    client:    PortalClient,
    primitive: Arc<dyn CapturePrimitive>,
}

impl PortalBackend {
    pub fn new(client: PortalClient, primitive: Arc<dyn CapturePrimitive>) -> Self {
        Self { client, primitive }
    }

    /// Connects to the session bus
    pub async fn connect(primitive: Arc<dyn CapturePrimitive>) -> CaptureResult<Self> {
        let bus = ZbusPortalBus::connect().await?;
        Ok(Self::new(PortalClient::new(Arc::new(bus)), primitive))
    }

    /// Takes a screenshot through the portal
    ///
    /// A region only turns on interactive mode; the portal decides what is
    /// captured. `monitor` is ignored.
    pub async fn capture(&self, region: Option<Region>, _monitor: usize) -> CaptureResult<Option<CapturedImage>> {
        self.client.screenshot(PortalRequest::new(region.is_some())).await
    }

    pub async fn capture_interactive(&self) -> CaptureResult<Option<CapturedImage>> {
        self.client.screenshot(PortalRequest::interactive()).await
    }

    pub async fn list_monitors(&self) -> Vec<MonitorRect> {
        wayland_monitors(&self.primitive).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::capture::mock::{MockPortalBus, MockPrimitive};

    fn signal(path: &str, code: u32, uri: Option<&str>) -> ResponseSignal {
        let mut results = HashMap::new();
        if let Some(uri) = uri {
            results.insert("uri".to_string(), ResultValue::Str(uri.to_string()));
        }
        ResponseSignal {
            path: path.to_string(),
            code,
            results,
        }
    }

    fn write_png(dir: &Path, name: &str) -> (PathBuf, String) {
        let path = dir.join(name);
        CapturedImage::from_test_pattern(32, 16).save(&path).unwrap();
        let uri = url::Url::from_file_path(&path).unwrap().to_string();
        (path, uri)
    }

    fn client(bus: Arc<MockPortalBus>) -> PortalClient {
        PortalClient::new(bus)
            .with_timeout(Some(Duration::from_secs(5)))
            .with_retry(5, Duration::from_millis(1))
    }

    #[test]
    fn test_pending_request_matches_last_segment() {
        let token = CaptureToken::generate();
        let handle = format!("/org/freedesktop/portal/desktop/request/1_42/{}", token);
        let pending = PendingRequest::register(token.clone(), handle.clone()).unwrap();

        assert!(pending.matches(&handle));
        assert!(pending.matches(&format!("/elsewhere/{}", token)));
        assert!(!pending.matches("/org/freedesktop/portal/desktop/request/1_42/other"));
        assert!(!pending.matches(&format!("/org/x/{}_suffix", token)));
    }

    #[test]
    fn test_pending_request_rejects_empty_handle() {
        let result = PendingRequest::register(CaptureToken::generate(), "");
        assert!(matches!(result, Err(CaptureError::ProtocolViolation { .. })));

        let result = PendingRequest::register(CaptureToken::generate(), "/trailing/");
        assert!(matches!(result, Err(CaptureError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_response_uri_cancellations() {
        assert_eq!(response_uri(&signal("/r/a", 1, Some("file:///x.png"))).unwrap(), None);
        assert_eq!(response_uri(&signal("/r/a", 2, None)).unwrap(), None);
        assert_eq!(response_uri(&signal("/r/a", 0, None)).unwrap(), None);
        assert_eq!(
            response_uri(&signal("/r/a", 0, Some("file:///x.png"))).unwrap(),
            Some("file:///x.png".to_string())
        );
    }

    #[test]
    fn test_response_uri_wrong_type_is_protocol_violation() {
        let mut bad = signal("/r/a", 0, None);
        bad.results.insert("uri".to_string(), ResultValue::U32(7));
        assert!(matches!(response_uri(&bad), Err(CaptureError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_uri_to_path() {
        assert_eq!(
            uri_to_path("file:///home/user/Pictures/Screenshot%20from%202024.png").unwrap(),
            PathBuf::from("/home/user/Pictures/Screenshot from 2024.png")
        );
        assert!(matches!(
            uri_to_path("https://example.com/a.png"),
            Err(CaptureError::ProtocolViolation { .. })
        ));
        assert!(matches!(uri_to_path("not a uri"), Err(CaptureError::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn test_open_with_retry_succeeds_after_two_misses() {
        let calls = AtomicU32::new(0);
        let result = open_with_retry(Path::new("/tmp/late.png"), 5, Duration::from_millis(1), |_| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(io::Error::from(io::ErrorKind::NotFound))
            } else {
                Ok("opened")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "opened");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_with_retry_gives_up_after_five_attempts() {
        let calls = AtomicU32::new(0);
        let result: CaptureResult<()> =
            open_with_retry(Path::new("/tmp/never.png"), 5, Duration::from_millis(1), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(io::Error::from(io::ErrorKind::NotFound))
            })
            .await;

        match result {
            Err(CaptureError::FileUnavailable { path, attempts }) => {
                assert_eq!(path, PathBuf::from("/tmp/never.png"));
                assert_eq!(attempts, 5);
            }
            other => panic!("expected FileUnavailable, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_open_with_retry_does_not_retry_other_errors() {
        let calls = AtomicU32::new(0);
        let result: CaptureResult<()> = open_with_retry(Path::new("/root/x"), 5, Duration::from_millis(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        })
        .await;

        assert!(matches!(result, Err(CaptureError::IoError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_screenshot_ignores_unrelated_responses() {
        let dir = tempfile::tempdir().unwrap();
        let (_, uri) = write_png(dir.path(), "shot.png");

        let bus = Arc::new(MockPortalBus::new());
        bus.push_foreign_response(signal("/org/freedesktop/portal/desktop/request/1_9/someone_else", 0, Some("file:///nope.png")));
        bus.push_matching_response(0, Some(&uri));

        let image = client(bus.clone()).screenshot(PortalRequest::new(false)).await.unwrap();
        assert_eq!(image.unwrap().dimensions(), (32, 16));

        let sent = bus.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].modal);
        assert!(!sent[0].interactive);
    }

    #[tokio::test]
    async fn test_screenshot_cancelled_by_user() {
        let bus = Arc::new(MockPortalBus::new());
        bus.push_matching_response(PORTAL_RESPONSE_CANCELLED, None);

        let result = client(bus).screenshot(PortalRequest::interactive()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_screenshot_missing_file() {
        let bus = Arc::new(MockPortalBus::new());
        bus.push_matching_response(0, Some("file:///nonexistent/libshot/never.png"));

        let result = client(bus).screenshot(PortalRequest::new(false)).await;
        assert!(matches!(result, Err(CaptureError::FileUnavailable { attempts: 5, .. })));
    }

    #[tokio::test]
    async fn test_screenshot_undecodable_file_is_image_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        fs::write(&path, b"garbage").unwrap();
        let uri = url::Url::from_file_path(&path).unwrap().to_string();

        let bus = Arc::new(MockPortalBus::new());
        bus.push_matching_response(0, Some(&uri));

        let result = client(bus).screenshot(PortalRequest::new(false)).await;
        assert!(matches!(result, Err(CaptureError::ImageError(_))));
    }

    #[test]
    fn test_timeout_millis_saturate() {
        assert_eq!(millis_saturating(Duration::from_secs(120)), 120_000);
        assert_eq!(millis_saturating(Duration::MAX), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_screenshot_times_out_without_response() {
        let bus = Arc::new(MockPortalBus::new());
        let client = PortalClient::new(bus).with_timeout(Some(Duration::from_secs(120)));

        let result = client.screenshot(PortalRequest::new(false)).await;
        assert!(matches!(result, Err(CaptureError::CaptureTimeout { duration_ms: 120_000 })));
    }

    #[tokio::test]
    async fn test_backend_interactive_flag() {
        let bus = Arc::new(MockPortalBus::new());
        bus.push_matching_response(1, None);
        bus.push_matching_response(1, None);
        bus.push_matching_response(1, None);

        let backend = PortalBackend::new(client(bus.clone()), Arc::new(MockPrimitive::single(1920, 1080)));
        backend.capture(None, 1).await.unwrap();
        backend.capture(Region::new(0, 0, 10, 10), 3).await.unwrap();
        backend.capture_interactive().await.unwrap();

        let flags: Vec<bool> = bus.requests().iter().map(|r| r.interactive).collect();
        assert_eq!(flags, vec![false, true, true]);
    }

    #[tokio::test]
    async fn test_backend_list_monitors_falls_back() {
        let bus = Arc::new(MockPortalBus::new());
        let backend = PortalBackend::new(client(bus), Arc::new(MockPrimitive::failing()));

        assert_eq!(backend.list_monitors().await, vec![MonitorRect::new(0, 0, 1920, 1080)]);
    }
}
