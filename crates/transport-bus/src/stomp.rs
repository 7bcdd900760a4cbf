//! STOMP 1.2 over WebSocket.
//!
//! The signaling broker speaks plain STOMP: clients `SEND` to an application
//! destination (`/app/signal/<topic>`) and receive `MESSAGE` frames for their
//! `SUBSCRIBE`d broker destination (`/topic/signal/<topic>`). Bearer tokens ride
//! on the `Authorization` native header of CONNECT and SUBSCRIBE.
//!
//! Heart-beats are negotiated on CONNECT. The writer sends a bare EOL every
//! outgoing period and the reader treats two incoming periods of silence as a
//! lost connection, ending every subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::{BusConnection, BusConnector, BusError, BusMessage, BusResult, BusSubscription};

const DEFAULT_PUBLISH_PREFIX: &str = "/app/signal/";
const DEFAULT_SUBSCRIBE_PREFIX: &str = "/topic/signal/";
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);
/// Incoming periods of silence tolerated before the broker is considered gone.
const SILENCE_FACTOR: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// First value for `name`; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn escapes_headers(&self) -> bool {
        self.command != "CONNECT" && self.command != "CONNECTED"
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.escapes_headers();
        let mut out = Vec::with_capacity(64 + self.body.len());
        out.extend_from_slice(self.command.as_bytes());
        out.push(b'\n');
        for (name, value) in &self.headers {
            if escape {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.push(b':');
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.push(b':');
                out.extend_from_slice(value.as_bytes());
            }
            out.push(b'\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out.push(0);
        out
    }

    /// Parses one frame. A payload made only of EOLs is a heart-beat and
    /// yields `Ok(None)`.
    pub fn decode(data: &[u8]) -> BusResult<Option<Frame>> {
        let start = data
            .iter()
            .position(|b| *b != b'\n' && *b != b'\r')
            .unwrap_or(data.len());
        let data = &data[start..];
        if data.is_empty() {
            return Ok(None);
        }

        let (command, mut rest) = split_line(data)?;
        if command.is_empty() {
            return Err(BusError::Protocol("empty command".into()));
        }
        let mut frame = Frame::new(command);
        let escaped = frame.escapes_headers();

        loop {
            let (line, remainder) = split_line(rest)?;
            rest = remainder;
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| BusError::Protocol(format!("malformed header line: {line}")))?;
            let (name, value) = if escaped {
                (unescape_header(name)?, unescape_header(value)?)
            } else {
                (name.to_string(), value.to_string())
            };
            frame.headers.push((name, value));
        }

        let body = match frame.get("content-length") {
            Some(len) => {
                let len: usize = len
                    .trim()
                    .parse()
                    .map_err(|_| BusError::Protocol(format!("invalid content-length: {len}")))?;
                if rest.get(len) != Some(&0) {
                    return Err(BusError::Protocol("frame body truncated".into()));
                }
                &rest[..len]
            }
            None => {
                let end = rest
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or_else(|| BusError::Protocol("frame missing NUL terminator".into()))?;
                &rest[..end]
            }
        };
        frame.body = Bytes::copy_from_slice(body);
        Ok(Some(frame))
    }
}

fn split_line(data: &[u8]) -> BusResult<(String, &[u8])> {
    let end = data
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| BusError::Protocol("unterminated frame line".into()))?;
    let mut line = &data[..end];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    let text = std::str::from_utf8(line)
        .map_err(|_| BusError::Protocol("frame line is not utf-8".into()))?;
    Ok((text.to_string(), &data[end + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> BusResult<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(BusError::Protocol(format!(
                    "undefined header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct StompConfig {
    pub url: Url,
    pub host: String,
    pub token: Option<String>,
    pub publish_prefix: String,
    pub subscribe_prefix: String,
    pub connect_timeout: Duration,
    /// Offered in both directions on CONNECT; zero disables heart-beats.
    pub heartbeat: Duration,
}

impl StompConfig {
    pub fn new(url: Url) -> Self {
        let host = url.host_str().unwrap_or("/").to_string();
        Self {
            url,
            host,
            token: None,
            publish_prefix: DEFAULT_PUBLISH_PREFIX.to_string(),
            subscribe_prefix: DEFAULT_SUBSCRIBE_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(10),
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    fn heartbeat_millis(&self) -> u64 {
        u64::try_from(self.heartbeat.as_millis()).unwrap_or(u64::MAX)
    }

    fn bearer(&self) -> Option<String> {
        self.token.as_ref().map(|token| format!("Bearer {token}"))
    }
}

pub struct StompConnector {
    config: StompConfig,
}

impl StompConnector {
    pub fn new(config: StompConfig) -> Self {
        Self { config }
    }
}

/// Periods agreed with the broker; `None` disables that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Heartbeats {
    outgoing: Option<Duration>,
    incoming: Option<Duration>,
}

impl Heartbeats {
    /// `connected` is the broker's `heart-beat` header: `sx,sy` where `sx` is
    /// what it can send and `sy` what it wants to receive.
    fn negotiate(ours_ms: u64, connected: Option<&str>) -> Self {
        let (sx, sy) = connected.and_then(parse_heart_beat).unwrap_or((0, 0));
        let pick = |ours: u64, theirs: u64| {
            (ours > 0 && theirs > 0).then(|| Duration::from_millis(ours.max(theirs)))
        };
        Self {
            outgoing: pick(ours_ms, sy),
            incoming: pick(ours_ms, sx),
        }
    }
}

fn parse_heart_beat(value: &str) -> Option<(u64, u64)> {
    let (send, receive) = value.split_once(',')?;
    Some((send.trim().parse().ok()?, receive.trim().parse().ok()?))
}

type Routes = Arc<parking_lot::Mutex<HashMap<String, (String, mpsc::UnboundedSender<BusMessage>)>>>;

#[async_trait]
impl BusConnector for StompConnector {
    async fn connect(&self) -> BusResult<Arc<dyn BusConnection>> {
        let config = &self.config;
        let (ws_stream, _) = tokio::time::timeout(
            config.connect_timeout,
            connect_async(config.url.as_str()),
        )
        .await
        .map_err(|_| BusError::Unavailable("stomp websocket connect timed out".into()))?
        .map_err(|err| BusError::Unavailable(format!("stomp websocket connect failed: {err}")))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let mut connect = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", config.host.clone())
            .header("heart-beat", format!("{0},{0}", config.heartbeat_millis()));
        if let Some(bearer) = config.bearer() {
            connect = connect.header("Authorization", bearer);
        }
        ws_write
            .send(frame_message(&connect))
            .await
            .map_err(|err| BusError::Transport(err.to_string()))?;

        let connected = loop {
            let message = tokio::time::timeout(config.connect_timeout, ws_read.next())
                .await
                .map_err(|_| BusError::Unavailable("stomp CONNECTED timed out".into()))?;
            let message = match message {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(BusError::Transport(err.to_string())),
                None => return Err(BusError::Closed),
            };
            let Some(frame) = decode_message(&message)? else {
                continue;
            };
            match frame.command.as_str() {
                "CONNECTED" => break frame,
                "ERROR" => {
                    return Err(BusError::Protocol(
                        frame.get("message").unwrap_or("broker refused CONNECT").to_string(),
                    ));
                }
                other => {
                    return Err(BusError::Protocol(format!(
                        "unexpected frame before CONNECTED: {other}"
                    )));
                }
            }
        };
        let heartbeats =
            Heartbeats::negotiate(config.heartbeat_millis(), connected.get("heart-beat"));
        tracing::debug!(
            target = "camp_live::bus",
            url = %config.url,
            outgoing = ?heartbeats.outgoing,
            incoming = ?heartbeats.incoming,
            "stomp session established"
        );

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let routes: Routes = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));

        let writer_routes = Arc::clone(&routes);
        let writer_open = Arc::clone(&open);
        let writer = tokio::spawn(async move {
            let mut ping = heartbeats.outgoing.map(|period| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });
            loop {
                let message = tokio::select! {
                    next = outbound_rx.recv() => match next {
                        Some(message) => message,
                        None => break,
                    },
                    _ = next_ping(&mut ping) => Message::Text("\n".into()),
                };
                if let Err(err) = ws_write.send(message).await {
                    tracing::debug!(target = "camp_live::bus", error = %err, "stomp writer stopped");
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
            writer_routes.lock().clear();
            let _ = ws_write.close().await;
        });

        let reader_routes = Arc::clone(&routes);
        let reader_open = Arc::clone(&open);
        let silence = heartbeats.incoming.map(|period| period * SILENCE_FACTOR);
        let reader = tokio::spawn(async move {
            loop {
                let next = match silence {
                    Some(limit) => match tokio::time::timeout(limit, ws_read.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            tracing::warn!(
                                target = "camp_live::bus",
                                silence_ms = limit.as_millis() as u64,
                                "stomp broker went silent"
                            );
                            break;
                        }
                    },
                    None => ws_read.next().await,
                };
                let Some(next) = next else {
                    break;
                };
                let message = match next {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::warn!(target = "camp_live::bus", error = %err, "stomp websocket error");
                        break;
                    }
                };
                if matches!(message, Message::Close(_)) {
                    break;
                }
                let frame = match decode_message(&message) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(target = "camp_live::bus", error = %err, "dropping malformed stomp frame");
                        continue;
                    }
                };
                match frame.command.as_str() {
                    "MESSAGE" => {
                        let Some(subscription) = frame.get("subscription") else {
                            continue;
                        };
                        let routes = reader_routes.lock();
                        if let Some((topic, tx)) = routes.get(subscription) {
                            let _ = tx.send(BusMessage {
                                topic: topic.clone(),
                                payload: frame.body.clone(),
                            });
                        }
                    }
                    "ERROR" => {
                        tracing::warn!(
                            target = "camp_live::bus",
                            reason = frame.get("message").unwrap_or_default(),
                            "stomp broker error"
                        );
                        break;
                    }
                    _ => {}
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            reader_routes.lock().clear();
        });

        Ok(Arc::new(StompConnection {
            config: config.clone(),
            outbound: outbound_tx,
            routes,
            next_subscription: AtomicU64::new(0),
            open,
            tasks: parking_lot::Mutex::new(vec![writer, reader]),
        }))
    }
}

struct StompConnection {
    config: StompConfig,
    outbound: mpsc::UnboundedSender<Message>,
    routes: Routes,
    next_subscription: AtomicU64,
    open: Arc<AtomicBool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StompConnection {
    fn send_frame(&self, frame: &Frame) -> BusResult<()> {
        if !self.is_open() {
            return Err(BusError::Closed);
        }
        self.outbound
            .send(frame_message(frame))
            .map_err(|_| BusError::Closed)
    }
}

#[async_trait]
impl BusConnection for StompConnection {
    async fn subscribe(&self, topic: &str) -> BusResult<BusSubscription> {
        let id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(id.clone(), (topic.to_string(), tx));

        let mut frame = Frame::new("SUBSCRIBE")
            .header("id", id.clone())
            .header("destination", format!("{}{}", self.config.subscribe_prefix, topic))
            .header("ack", "auto");
        if let Some(bearer) = self.config.bearer() {
            frame = frame.header("Authorization", bearer);
        }
        if let Err(err) = self.send_frame(&frame) {
            self.routes.lock().remove(&id);
            return Err(err);
        }
        Ok(BusSubscription::new(topic, rx))
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let frame = Frame::new("SEND")
            .header("destination", format!("{}{}", self.config.publish_prefix, topic))
            .header("content-type", "application/json")
            .with_body(payload);
        self.send_frame(&frame)
    }

    async fn close(&self) {
        let _ = self.send_frame(&Frame::new("DISCONNECT"));
        self.open.store(false, Ordering::SeqCst);
        self.routes.lock().clear();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for StompConnection {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

async fn next_ping(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn frame_message(frame: &Frame) -> Message {
    match String::from_utf8(frame.encode()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

fn decode_message(message: &Message) -> BusResult<Option<Frame>> {
    match message {
        Message::Text(text) => Frame::decode(text.as_bytes()),
        Message::Binary(data) => Frame::decode(data),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn send_frame_escapes_headers_and_sets_length() {
        let frame = Frame::new("SEND")
            .header("destination", "/app/signal/7")
            .header("x-note", "a:b\nc")
            .with_body(Bytes::from_static(b"{\"type\":\"join\"}"));
        let encoded = frame.encode();
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.starts_with("SEND\ndestination:/app/signal/7\n"));
        assert!(text.contains("x-note:a\\cb\\nc\n"));
        assert!(text.contains("content-length:15\n"));
        assert_eq!(encoded.last(), Some(&0));

        let decoded = Frame::decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded.get("x-note"), Some("a:b\nc"));
        assert_eq!(decoded.body, frame.body);
    }

    #[test]
    fn connect_frame_headers_are_not_escaped() {
        let frame = Frame::new("CONNECT").header("host", "a:b");
        let text = String::from_utf8(frame.encode()).unwrap();
        assert!(text.contains("host:a:b\n"));
        let decoded = Frame::decode(text.as_bytes()).unwrap().unwrap();
        assert_eq!(decoded.get("host"), Some("a:b"));
    }

    #[test]
    fn content_length_allows_nul_in_body() {
        let raw = b"MESSAGE\nsubscription:sub-0\ncontent-length:3\n\na\0b\0";
        let frame = Frame::decode(raw).unwrap().unwrap();
        assert_eq!(frame.body.as_ref(), b"a\0b");
    }

    #[test]
    fn oversized_content_length_is_rejected() {
        let raw = b"MESSAGE\nsubscription:sub-0\ncontent-length:18446744073709551615\n\nab\0";
        assert!(matches!(Frame::decode(raw), Err(BusError::Protocol(_))));
        let raw = b"MESSAGE\ncontent-length:5\n\nab\0";
        assert!(Frame::decode(raw).is_err());
    }

    #[test]
    fn heartbeat_negotiation() {
        let both = Heartbeats::negotiate(10_000, Some("5000,20000"));
        assert_eq!(both.outgoing, Some(Duration::from_secs(20)));
        assert_eq!(both.incoming, Some(Duration::from_secs(10)));

        let broker_silent = Heartbeats::negotiate(10_000, Some("0,0"));
        assert_eq!(broker_silent.outgoing, None);
        assert_eq!(broker_silent.incoming, None);

        let no_header = Heartbeats::negotiate(10_000, None);
        assert_eq!(no_header, broker_silent);

        let we_decline = Heartbeats::negotiate(0, Some("1000,1000"));
        assert_eq!(we_decline, broker_silent);

        let garbage = Heartbeats::negotiate(10_000, Some("soon"));
        assert_eq!(garbage, broker_silent);
    }

    #[test]
    fn heartbeat_and_malformed_frames() {
        assert!(Frame::decode(b"\n").unwrap().is_none());
        assert!(Frame::decode(b"\r\n\n").unwrap().is_none());
        assert!(Frame::decode(b"MESSAGE\n\nbody-without-nul").is_err());
        assert!(Frame::decode(b"SEND\nbad-header\n\n\0").is_err());
        assert!(Frame::decode(b"SEND\nk:\\t\n\n\0").is_err());
    }

    #[test]
    fn first_header_occurrence_wins() {
        let frame = Frame::decode(b"MESSAGE\nfoo:1\nfoo:2\n\n\0").unwrap().unwrap();
        assert_eq!(frame.get("foo"), Some("1"));
    }

    struct Broker {
        url: Url,
        seen: mpsc::UnboundedReceiver<Frame>,
        heartbeats: Arc<AtomicUsize>,
    }

    /// Minimal broker: accepts CONNECT, records SUBSCRIBE ids and echoes every
    /// SEND body back as a MESSAGE for the matching subscription. It counts the
    /// heart-beats it receives but never sends any, whatever it advertises in
    /// `heart_beat`.
    async fn spawn_echo_broker(heart_beat: Option<&'static str>) -> Broker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let heartbeats = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&heartbeats);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut subscriptions: HashMap<String, String> = HashMap::new();
            while let Some(Ok(message)) = ws.next().await {
                let frame = match decode_message(&message) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        if matches!(message, Message::Text(_)) {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                        continue;
                    }
                    Err(_) => continue,
                };
                let _ = seen_tx.send(frame.clone());
                match frame.command.as_str() {
                    "CONNECT" => {
                        let mut reply = Frame::new("CONNECTED").header("version", "1.2");
                        if let Some(heart_beat) = heart_beat {
                            reply = reply.header("heart-beat", heart_beat);
                        }
                        ws.send(frame_message(&reply)).await.unwrap();
                    }
                    "SUBSCRIBE" => {
                        let destination = frame.get("destination").unwrap().to_string();
                        subscriptions.insert(destination, frame.get("id").unwrap().to_string());
                    }
                    "SEND" => {
                        let destination = frame
                            .get("destination")
                            .unwrap()
                            .replacen("/app/signal/", "/topic/signal/", 1);
                        if let Some(id) = subscriptions.get(&destination) {
                            let reply = Frame::new("MESSAGE")
                                .header("subscription", id.clone())
                                .header("destination", destination.clone())
                                .with_body(frame.body.clone());
                            ws.send(frame_message(&reply)).await.unwrap();
                        }
                    }
                    _ => {}
                }
            }
        });
        Broker {
            url: Url::parse(&format!("ws://{addr}/ws")).unwrap(),
            seen: seen_rx,
            heartbeats,
        }
    }

    #[tokio::test]
    async fn stomp_connection_round_trip_through_broker() {
        let Broker { url, mut seen, .. } = spawn_echo_broker(None).await;
        let connector = StompConnector::new(StompConfig::new(url).with_token(Some("t0k".into())));
        let conn = connector.connect().await.expect("stomp connect");

        let connect = seen.recv().await.unwrap();
        assert_eq!(connect.command, "CONNECT");
        assert_eq!(connect.get("Authorization"), Some("Bearer t0k"));
        assert_eq!(connect.get("heart-beat"), Some("10000,10000"));

        let mut sub = conn.subscribe("99").await.expect("subscribe");
        let subscribe = seen.recv().await.unwrap();
        assert_eq!(subscribe.get("destination"), Some("/topic/signal/99"));

        conn.publish("99", Bytes::from_static(b"{\"type\":\"join\",\"sender\":\"a\"}"))
            .expect("publish");
        let message = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("message in time")
            .expect("subscription open");
        assert_eq!(message.topic, "99");
        assert_eq!(
            message.payload,
            Bytes::from_static(b"{\"type\":\"join\",\"sender\":\"a\"}")
        );

        conn.close().await;
        assert!(!conn.is_open());
        assert!(conn.publish("99", Bytes::new()).is_err());
    }

    #[tokio::test]
    async fn silent_broker_ends_subscriptions() {
        let broker = spawn_echo_broker(Some("200,200")).await;
        let config = StompConfig::new(broker.url).with_heartbeat(Duration::from_millis(200));
        let conn = StompConnector::new(config).connect().await.expect("stomp connect");
        let mut sub = conn.subscribe("7").await.expect("subscribe");

        let ended = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("subscription should end once the broker goes quiet");
        assert!(ended.is_none());
        assert!(!conn.is_open());
        assert!(conn.publish("7", Bytes::new()).is_err());
        assert!(broker.heartbeats.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn declined_heartbeats_leave_quiet_connection_open() {
        let mut broker = spawn_echo_broker(Some("0,0")).await;
        let config = StompConfig::new(broker.url).with_heartbeat(Duration::from_millis(50));
        let conn = StompConnector::new(config).connect().await.expect("stomp connect");
        let mut sub = conn.subscribe("7").await.expect("subscribe");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(conn.is_open());
        assert_eq!(broker.heartbeats.load(Ordering::SeqCst), 0);

        conn.publish("7", Bytes::from_static(b"{}")).expect("publish");
        let message = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("message in time")
            .expect("subscription open");
        assert_eq!(message.payload, Bytes::from_static(b"{}"));
        assert_eq!(broker.seen.recv().await.unwrap().command, "CONNECT");
    }
}
