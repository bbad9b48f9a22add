//! Upstream stream connection: dial, heartbeat, read loop, graceful close, reconnect.
//!
//! One session runs a reader task (decode frames, dispatch events in arrival order) and a
//! control loop that selects over cancellation, reader termination, and the heartbeat tick.
//! [`StreamClient::supervise`] reconnects after transient failures until cancelled.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    handshake::client::Request,
    http::{header::AUTHORIZATION, HeaderValue},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::{AuthMode, Settings};
use crate::dispatch::Dispatcher;
use crate::error::{ConnectionError, DecodeError, DeliveryError};
use crate::event::InboundEvent;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings shared between the lifecycle owner and the supervisor. Swapped, never mutated.
pub type SharedSettings = Arc<RwLock<Arc<Settings>>>;

/// Lifecycle of the upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// How the reader task ended.
#[derive(Debug)]
enum ReadEnd {
    /// Stream ended; carries the peer's close frame if one was received.
    Closed(Option<CloseFrame<'static>>),
    Failed(tungstenite::Error),
}

impl From<ReadEnd> for ConnectionError {
    fn from(end: ReadEnd) -> Self {
        match end {
            ReadEnd::Closed(Some(frame)) => ConnectionError::RemoteClosed {
                code: frame.code.into(),
                reason: frame.reason.into_owned(),
            },
            ReadEnd::Closed(None) => ConnectionError::RemoteClosed {
                code: CloseCode::Abnormal.into(),
                reason: "stream ended without close frame".to_string(),
            },
            ReadEnd::Failed(e) => ConnectionError::Read(e),
        }
    }
}

fn reader_result(joined: Result<ReadEnd, JoinError>) -> ConnectionError {
    match joined {
        Ok(end) => end.into(),
        Err(e) => ConnectionError::Reader(e.to_string()),
    }
}

/// Client for the upstream notification stream.
pub struct StreamClient {
    settings: SharedSettings,
    http: reqwest::Client,
    state: watch::Sender<ConnectionState>,
}

impl StreamClient {
    pub fn new(settings: SharedSettings) -> Self {
        Self::with_http_client(settings, reqwest::Client::new())
    }

    /// Use a specific HTTP client for webhook deliveries.
    pub fn with_http_client(settings: SharedSettings, http: reqwest::Client) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            http,
            state,
        }
    }

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Reconnect loop. Takes a fresh settings snapshot per connect cycle and returns only
    /// once `cancel` fires.
    pub async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let settings = self.settings.read().await.clone();
            match self.run_session(&settings, &cancel).await {
                Ok(()) => break,
                Err(_) if cancel.is_cancelled() => {
                    log::info!("stream session cancelled");
                    break;
                }
                Err(e) => {
                    log::error!(
                        "stream session to {} failed, retrying after {:?}: {}",
                        settings.stream_url,
                        RECONNECT_DELAY,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        log::info!("stream supervisor stopped");
    }

    /// Run one session until cancelled (`Ok`) or until the connection fails (`Err`).
    pub async fn run_session(
        &self,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connecting);
        let result = self.connect_and_serve(settings, cancel).await;
        self.set_state(ConnectionState::Disconnected);
        result
    }

    async fn connect_and_serve(
        &self,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        let request = stream_request(settings)?;
        let ws = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = tokio_tungstenite::connect_async(request) => {
                res.map_err(ConnectionError::Dial)?.0
            }
        };
        log::info!("connected to stream at {}", settings.stream_url);
        self.set_state(ConnectionState::Connected);

        let (mut sink, stream) = ws.split();
        let dispatcher = Dispatcher::with_client(self.http.clone(), settings.destinations.clone());
        let mut reader = tokio::spawn(read_loop(stream, dispatcher, cancel.clone()));

        let mut ticker =
            tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.shutdown(&mut sink, &mut reader).await;
                    break Ok(());
                }
                joined = &mut reader => {
                    self.set_state(ConnectionState::Closing);
                    break Err(reader_result(joined));
                }
                _ = ticker.tick() => {
                    let beat = Message::Text(chrono::Local::now().to_rfc3339());
                    match send_unless_cancelled(&mut sink, beat, cancel).await {
                        Some(Ok(())) => {}
                        Some(Err(e)) => {
                            self.set_state(ConnectionState::Closing);
                            break Err(ConnectionError::Heartbeat(e));
                        }
                        None => {
                            self.shutdown(&mut sink, &mut reader).await;
                            break Ok(());
                        }
                    }
                }
            }
        };
        reader.abort();
        result
    }

    async fn shutdown(
        &self,
        sink: &mut SplitSink<WsStream, Message>,
        reader: &mut JoinHandle<ReadEnd>,
    ) {
        self.set_state(ConnectionState::Closing);
        log::info!("shutdown requested, closing stream connection");
        close_gracefully(sink, reader).await;
    }
}

/// Send `msg`, giving up as soon as `cancel` fires. `None` means cancelled.
async fn send_unless_cancelled<S>(
    sink: &mut S,
    msg: Message,
    cancel: &CancellationToken,
) -> Option<Result<(), tungstenite::Error>>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => None,
        res = sink.send(msg) => Some(res),
    }
}

/// Build the upgrade request with the client token attached per the auth mode.
fn stream_request(settings: &Settings) -> Result<Request, ConnectionError> {
    let mut url = settings.stream_url.clone();
    if settings.auth_mode == AuthMode::Query {
        url.query_pairs_mut()
            .append_pair("token", &settings.client_token);
    }
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(ConnectionError::Request)?;
    if settings.auth_mode == AuthMode::Header {
        let value = HeaderValue::from_str(&format!("Bearer {}", settings.client_token))
            .map_err(|e| ConnectionError::Request(tungstenite::Error::HttpFormat(e.into())))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

/// Send a normal close frame and give the peer [`CLOSE_TIMEOUT`] to acknowledge it.
/// Each step is bounded by [`CLOSE_TIMEOUT`]; failures are logged only.
async fn close_gracefully<S>(sink: &mut S, reader: &mut JoinHandle<ReadEnd>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            log::debug!("{}", ConnectionError::Close(e));
            return;
        }
        Err(_) => {
            log::debug!("close frame not written within {:?}", CLOSE_TIMEOUT);
            return;
        }
    }
    match tokio::time::timeout(CLOSE_TIMEOUT, reader).await {
        Ok(_) => log::debug!("stream close acknowledged"),
        Err(_) => log::debug!("no close acknowledgement within {:?}", CLOSE_TIMEOUT),
    }
}

/// Read frames until the stream ends. Events are dispatched one at a time, in order.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
) -> ReadEnd {
    let mut close_frame = None;
    loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                return ReadEnd::Closed(close_frame)
            }
            Some(Err(e)) => return ReadEnd::Failed(e),
        };
        let decoded = match msg {
            Message::Text(text) => InboundEvent::decode(&text),
            Message::Binary(bytes) => InboundEvent::decode_bytes(&bytes),
            Message::Close(frame) => {
                log::debug!("stream close frame received: {:?}", frame);
                close_frame = frame.or(close_frame);
                continue;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        match decoded {
            Ok(event) => handle_event(&dispatcher, &event, &cancel).await,
            Err(e) => log_decode_error(&e),
        }
    }
}

fn log_decode_error(err: &DecodeError) {
    log::warn!("dropping inbound frame: {}", err);
}

async fn handle_event(dispatcher: &Dispatcher, event: &InboundEvent, cancel: &CancellationToken) {
    log::debug!(
        "event {} from app {} received, forwarding to {} destination(s)",
        event.id,
        event.appid,
        dispatcher.destinations().len()
    );
    let errors = dispatcher.dispatch(event, cancel).await;
    for e in &errors {
        log::log!(
            delivery_log_level(e, cancel),
            "failed to send message {}: {}",
            event.id,
            e
        );
    }
}

/// Deliveries cut short by shutdown are expected and only logged at debug.
fn delivery_log_level(err: &DeliveryError, cancel: &CancellationToken) -> log::Level {
    match err {
        DeliveryError::Cancelled { .. } if cancel.is_cancelled() => log::Level::Debug,
        _ => log::Level::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn settings(mode: AuthMode) -> Settings {
        Config {
            client_token: Some("s3cret token".to_string()),
            host_server: "ws://127.0.0.1:1".to_string(),
            auth_mode: mode,
            web_hooks: Vec::new(),
        }
        .validate()
        .unwrap()
    }

    #[test]
    fn header_auth_sets_bearer() {
        let req = stream_request(&settings(AuthMode::Header)).unwrap();
        assert_eq!(req.uri().to_string(), "ws://127.0.0.1:1/stream");
        assert_eq!(
            req.headers().get(AUTHORIZATION).unwrap(),
            "Bearer s3cret token"
        );
    }

    #[test]
    fn query_auth_appends_token() {
        let req = stream_request(&settings(AuthMode::Query)).unwrap();
        assert_eq!(req.uri().to_string(), "ws://127.0.0.1:1/stream?token=s3cret+token");
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    /// A sink whose peer never drains it.
    struct Stalled;

    impl Sink<Message> for Stalled {
        type Error = tungstenite::Error;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test]
    async fn stalled_heartbeat_yields_to_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let sent = tokio::time::timeout(
            Duration::from_secs(2),
            send_unless_cancelled(&mut Stalled, Message::Text("beat".into()), &cancel),
        )
        .await
        .expect("blocked send ignored cancellation");
        assert!(sent.is_none());
    }

    #[tokio::test]
    async fn close_on_stalled_sink_is_bounded() {
        let mut reader = tokio::spawn(std::future::pending::<ReadEnd>());
        let started = Instant::now();
        close_gracefully(&mut Stalled, &mut reader).await;
        assert!(started.elapsed() < CLOSE_TIMEOUT * 2);
        reader.abort();
    }

    #[test]
    fn shutdown_cancellations_are_not_errors() {
        let err = DeliveryError::Cancelled {
            url: "http://example.com".to_string(),
        };
        let cancel = CancellationToken::new();
        assert_eq!(delivery_log_level(&err, &cancel), log::Level::Error);
        cancel.cancel();
        assert_eq!(delivery_log_level(&err, &cancel), log::Level::Debug);
        let status = DeliveryError::Status {
            url: "http://example.com".to_string(),
            status: 500,
        };
        assert_eq!(delivery_log_level(&status, &cancel), log::Level::Error);
    }

    #[test]
    fn close_without_frame_is_abnormal() {
        let err: ConnectionError = ReadEnd::Closed(None).into();
        assert!(matches!(err, ConnectionError::RemoteClosed { code: 1006, .. }));
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        let client = StreamClient::new(Arc::new(RwLock::new(Arc::new(settings(AuthMode::Header)))));
        let s = settings(AuthMode::Header);
        let err = client
            .run_session(&s, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Dial(_)));
        assert_eq!(*client.state().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancelled_before_dial_is_clean() {
        let s = Arc::new(settings(AuthMode::Header));
        let client = Arc::new(StreamClient::new(Arc::new(RwLock::new(s.clone()))));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(client.run_session(&s, &cancel).await.is_ok());
        client.clone().supervise(cancel).await;
        assert_eq!(*client.state().borrow(), ConnectionState::Disconnected);
    }
}
