//! The HTTP-polling relay manager.
//!
//! Outbound events are wrapped encrypt(compress(event)), framed with the
//! session token, split by the transport's package-size ceiling, and POSTed
//! to a relay worker's `push` endpoint. A long-lived pull loop POSTs to
//! `pull` and reads the response body as a stream of 4-byte big-endian
//! length-prefixed frames; decoded events are routed back to their owning
//! session by correlation hash.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burrow_proto::event::{
    unwrap_event, CompressEvent, CompressMethod, ConnectionStatus, EncryptEvent, EncryptMethod,
    HttpRequestEvent, SegmentEvent, SocketConnectionEvent, TcpChunkEvent, UserLoginEvent,
};
use burrow_proto::frame::encode_framed;
use burrow_proto::segment::{split_frame, Reassembler};
use burrow_proto::{Event, FrameTags, Registry};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::{ConnectionManager, SessionHandle, TunnelHandle};
use crate::config::{RelayConfig, WireConfig};
use crate::error::BackendError;
use crate::http;
use crate::selector::ListSelector;

pub const MANAGER_NAME: &str = "relay";

const TUNNEL_CHANNEL_DEPTH: usize = 32;
const PULL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Range window added to a retried GET so a worker that died mid-fetch can
/// restart with a bounded answer.
const RETRY_RANGE: &str = "bytes=0-262143";

#[derive(Clone)]
struct WireSettings {
    tags: FrameTags,
    compress: CompressMethod,
    encrypt: EncryptMethod,
    max_package_size: usize,
}

pub struct RelayManager {
    registry: Arc<Registry>,
    client: reqwest::Client,
    workers: ListSelector<String>,
    wire: WireSettings,
    user: String,
    timeout: Duration,
    attempts: u32,
    reassembler: Reassembler,
    /// One-shot reply waiters, keyed by correlation hash. At most one
    /// in-flight request per session keeps this unambiguous.
    pending: Mutex<HashMap<u32, oneshot::Sender<Box<dyn Event>>>>,
    /// Tunnel downlink channels, keyed by correlation hash. Shared with the
    /// uplink tasks so they can release their entry when they stop.
    tunnels: Arc<Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>>,
}

impl RelayManager {
    /// Builds the manager and spawns one pull loop per configured worker.
    pub fn spawn(
        registry: Arc<Registry>,
        wire: &WireConfig,
        relay: &RelayConfig,
    ) -> Result<Arc<Self>, BackendError> {
        let workers = ListSelector::new(relay.workers.clone())
            .ok_or_else(|| BackendError::NoManager("relay (no workers configured)".to_string()))?;
        let tags = match &wire.user {
            Some(user) => FrameTags::with_user(&wire.token, user),
            None => FrameTags::new(&wire.token),
        };
        let manager = Arc::new(RelayManager {
            registry,
            client: reqwest::Client::new(),
            workers,
            wire: WireSettings {
                tags,
                compress: wire.compress_method().unwrap_or(CompressMethod::None),
                encrypt: wire.encrypt_method().unwrap_or(EncryptMethod::None),
                max_package_size: wire.max_package_size,
            },
            user: relay.user.clone(),
            timeout: Duration::from_secs(relay.timeout_secs),
            attempts: relay.attempts,
            reassembler: Reassembler::default(),
            pending: Mutex::new(HashMap::new()),
            tunnels: Arc::new(Mutex::new(HashMap::new())),
        });

        for worker in manager.workers.iter() {
            let manager = Arc::clone(&manager);
            let base = worker.clone();
            tokio::spawn(async move {
                manager.login(&base).await;
                manager.pull_loop(base).await;
            });
        }
        Ok(manager)
    }

    fn push_url(base: &str) -> String {
        format!("{}/push", base.trim_end_matches('/'))
    }

    fn pull_url(base: &str) -> String {
        format!("{}/pull", base.trim_end_matches('/'))
    }

    /// Wraps, frames and splits one event into ready-to-send transport units.
    fn encode_units(&self, ev: Box<dyn Event>) -> Vec<Vec<u8>> {
        let hash = ev.hash();
        let mut wrapped = EncryptEvent::new(
            self.wire.encrypt,
            Box::new(CompressEvent::new(self.wire.compress, ev)),
        );
        wrapped.set_hash(hash);
        let mut frame = Vec::new();
        encode_framed(&mut frame, &self.wire.tags, &wrapped);
        split_frame(&frame, self.wire.max_package_size, hash, &self.wire.tags)
    }

    async fn push_units(&self, base: &str, units: Vec<Vec<u8>>) -> Result<(), BackendError> {
        let url = Self::push_url(base);
        for unit in units {
            let response = self
                .client
                .post(&url)
                .header("Content-Type", "application/octet-stream")
                .header("UserToken", &self.user)
                .body(unit)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(BackendError::Status(response.status().as_u16()));
            }
        }
        Ok(())
    }

    async fn push_event(&self, base: &str, ev: Box<dyn Event>) -> Result<(), BackendError> {
        let units = self.encode_units(ev);
        self.push_units(base, units).await
    }

    async fn login(&self, base: &str) {
        let login = Box::new(UserLoginEvent { user: self.user.clone(), hash: 0 });
        if let Err(error) = self.push_event(base, login).await {
            warn!(worker = base, %error, "relay login failed");
        } else {
            info!(worker = base, "relay login sent");
        }
    }

    async fn pull_loop(self: Arc<Self>, base: String) {
        let url = Self::pull_url(&base);
        let mut accumulator = PullAccumulator::default();
        loop {
            let result = self
                .client
                .post(&url)
                .header("Content-Type", "application/octet-stream")
                .header("UserToken", &self.user)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    let mut response = response;
                    loop {
                        match response.chunk().await {
                            Ok(Some(bytes)) => {
                                for frame in accumulator.feed(&bytes) {
                                    self.handle_frame(&frame).await;
                                }
                            }
                            Ok(None) => break,
                            Err(error) => {
                                debug!(worker = base, %error, "pull body ended");
                                break;
                            }
                        }
                    }
                }
                Ok(response) => {
                    warn!(worker = base, status = %response.status(), "pull rejected");
                    tokio::time::sleep(PULL_RETRY_DELAY).await;
                }
                Err(error) => {
                    warn!(worker = base, %error, "pull failed");
                    tokio::time::sleep(PULL_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Decodes one pulled frame and routes the event to its session.
    async fn handle_frame(&self, frame: &[u8]) {
        let parsed = match self.registry.parse_framed(frame) {
            Ok((_, ev)) => unwrap_event(ev),
            Err(error) => {
                warn!(%error, "dropping undecodable pulled frame");
                return;
            }
        };

        if parsed.as_any().is::<SegmentEvent>() {
            let seg = match parsed.into_any().downcast::<SegmentEvent>() {
                Ok(seg) => *seg,
                Err(_) => return,
            };
            match self.reassembler.accept(seg) {
                Ok(Some(whole)) => Box::pin(self.handle_frame(&whole)).await,
                Ok(None) => {}
                Err(error) => warn!(%error, "dropping segment set"),
            }
            return;
        }

        let hash = parsed.hash();
        if let Some(chunk) = parsed.as_any().downcast_ref::<TcpChunkEvent>() {
            let sender = self.tunnels.lock().unwrap_or_else(|e| e.into_inner()).get(&hash).cloned();
            match sender {
                Some(sender) => {
                    if sender.send(chunk.content.clone()).await.is_err() {
                        self.drop_tunnel(hash);
                    }
                }
                None => debug!(session = hash, "chunk for unknown tunnel"),
            }
            return;
        }
        if let Some(conn) = parsed.as_any().downcast_ref::<SocketConnectionEvent>() {
            if conn.status == ConnectionStatus::Closed {
                debug!(session = hash, "remote closed tunnel");
                self.drop_tunnel(hash);
                return;
            }
        }

        let waiter = self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&hash);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(parsed);
            }
            None => debug!(session = hash, "reply for no waiting session"),
        }
    }

    fn register_waiter(&self, hash: u32) -> oneshot::Receiver<Box<dyn Event>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(hash, tx);
        rx
    }

    fn cancel_waiter(&self, hash: u32) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&hash);
    }

    fn drop_tunnel(&self, hash: u32) {
        self.tunnels.lock().unwrap_or_else(|e| e.into_inner()).remove(&hash);
    }

    /// Sends an HTTP request and waits for the routed reply, retrying up to
    /// the attempts budget. Retried GETs gain a bounded Range window.
    async fn request_http(
        &self,
        session: &SessionHandle,
        mut req: HttpRequestEvent,
    ) -> Result<Option<Box<dyn Event>>, BackendError> {
        let url = req.url.clone();
        let hash = req.hash;
        for attempt in 0..self.attempts {
            let base = self.workers.select().clone();
            let waiter = self.register_waiter(hash);
            if let Err(error) = self.push_event(&base, Box::new(req.clone())).await {
                self.cancel_waiter(hash);
                warn!(session = session.id, %error, attempt, "relay push failed");
                continue;
            }
            match tokio::time::timeout(self.timeout, waiter).await {
                Ok(Ok(reply)) => return Ok(Some(reply)),
                Ok(Err(_)) => return Err(BackendError::Closed),
                Err(_) => {
                    self.cancel_waiter(hash);
                    debug!(session = session.id, attempt, "relay reply timed out");
                    if req.method.eq_ignore_ascii_case("GET") && req.header("Range").is_none() {
                        req.set_header("Range", RETRY_RANGE);
                    }
                }
            }
        }
        Ok(Some(Box::new(http::synthesize(
            408,
            &format!("fetch timeout for url {url}"),
            hash,
        ))))
    }

    /// Forwards uplink bytes as sequenced chunk events. Whatever stops the
    /// task, it releases the tunnel entry so the session's downlink sees the
    /// channel close instead of waiting on a worker that never answers.
    fn spawn_uplink(&self, push_url: String, hash: u32, mut rx_up: mpsc::Receiver<Vec<u8>>) {
        let client = self.client.clone();
        let wire = self.wire.clone();
        let user = self.user.clone();
        let tunnels = Arc::clone(&self.tunnels);
        tokio::spawn(async move {
            let mut sequence = 0u32;
            let mut delivered = true;
            'uplink: while let Some(bytes) = rx_up.recv().await {
                let chunk = TcpChunkEvent { sequence, content: bytes, hash };
                sequence = sequence.wrapping_add(1);
                let mut wrapped = EncryptEvent::new(
                    wire.encrypt,
                    Box::new(CompressEvent::new(wire.compress, Box::new(chunk))),
                );
                wrapped.set_hash(hash);
                let mut frame = Vec::new();
                encode_framed(&mut frame, &wire.tags, &wrapped);
                for unit in split_frame(&frame, wire.max_package_size, hash, &wire.tags) {
                    let sent = client
                        .post(&push_url)
                        .header("Content-Type", "application/octet-stream")
                        .header("UserToken", &user)
                        .body(unit)
                        .send()
                        .await;
                    if sent.is_err() {
                        warn!(session = hash, "tunnel uplink push failed");
                        delivered = false;
                        break 'uplink;
                    }
                }
            }
            if delivered {
                // Client side hung up; tell the remote end.
                let close = SocketConnectionEvent {
                    status: ConnectionStatus::Closed,
                    addr: String::new(),
                    hash,
                };
                let mut wrapped = EncryptEvent::new(
                    wire.encrypt,
                    Box::new(CompressEvent::new(wire.compress, Box::new(close))),
                );
                wrapped.set_hash(hash);
                let mut frame = Vec::new();
                encode_framed(&mut frame, &wire.tags, &wrapped);
                let _ = client
                    .post(&push_url)
                    .header("Content-Type", "application/octet-stream")
                    .header("UserToken", &user)
                    .body(frame)
                    .send()
                    .await;
            }
            tunnels.lock().unwrap_or_else(|e| e.into_inner()).remove(&hash);
        });
    }
}

/// Splits a pulled byte stream into 4-byte big-endian length-prefixed
/// frames, tolerating frames cut across read boundaries.
#[derive(Default)]
struct PullAccumulator {
    buffer: Vec<u8>,
}

impl PullAccumulator {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < 4 {
                return frames;
            }
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if self.buffer.len() < 4 + len {
                return frames;
            }
            frames.push(self.buffer[4..4 + len].to_vec());
            self.buffer.drain(..4 + len);
        }
    }
}

#[async_trait]
impl ConnectionManager for RelayManager {
    fn name(&self) -> &str {
        MANAGER_NAME
    }

    async fn request(
        &self,
        session: &SessionHandle,
        ev: Box<dyn Event>,
    ) -> Result<Option<Box<dyn Event>>, BackendError> {
        if ev.as_any().is::<HttpRequestEvent>() {
            // Unbox before awaiting; the downcast error half is not Send.
            let req = match ev.into_any().downcast::<HttpRequestEvent>() {
                Ok(req) => *req,
                Err(_) => return Err(BackendError::Closed),
            };
            return self.request_http(session, req).await;
        }
        // Write-only traffic: push and report nothing to wait for.
        let base = self.workers.select().clone();
        self.push_event(&base, ev).await?;
        Ok(None)
    }

    async fn open_tunnel(
        &self,
        session: &SessionHandle,
        addr: &str,
    ) -> Result<TunnelHandle, BackendError> {
        let hash = session.id;
        let base = self.workers.select().clone();

        let (tx_up, rx_up) = mpsc::channel::<Vec<u8>>(TUNNEL_CHANNEL_DEPTH);
        let (tx_down, rx_down) = mpsc::channel::<Vec<u8>>(TUNNEL_CHANNEL_DEPTH);
        self.tunnels.lock().unwrap_or_else(|e| e.into_inner()).insert(hash, tx_down);

        let open = Box::new(SocketConnectionEvent {
            status: ConnectionStatus::Connected,
            addr: addr.to_string(),
            hash,
        });
        if let Err(error) = self.push_event(&base, open).await {
            self.drop_tunnel(hash);
            return Err(error);
        }
        debug!(session = hash, %addr, "relay tunnel open");

        self.spawn_uplink(Self::push_url(&base), hash, rx_up);
        Ok(TunnelHandle { tx: tx_up, rx: rx_down })
    }

    async fn close_session(&self, session: &SessionHandle) {
        self.cancel_waiter(session.id);
        self.drop_tunnel(session.id);
    }
}
