//! The direct-connect manager: no relay in the middle, the proxy itself
//! opens a socket to the destination. Useful where only DNS or host-level
//! blocking is in play, and as the fallback when no relay workers are
//! configured.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use burrow_proto::event::{unwrap_event, HttpRequestEvent};
use burrow_proto::Event;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::try_join;
use tracing::debug;

use crate::backend::{ConnectionManager, SessionHandle, TunnelHandle};
use crate::config::DirectConfig;
use crate::error::BackendError;
use crate::http;

pub const MANAGER_NAME: &str = "direct";

const TUNNEL_CHANNEL_DEPTH: usize = 32;
const TUNNEL_READ_BUFFER: usize = 16 * 1024;

pub struct DirectManager {
    /// Logical destination to real `host:port` overrides, checked before
    /// connecting. Keys may be bare hosts or full `host:port` pairs.
    hosts: HashMap<String, String>,
}

impl DirectManager {
    pub fn new(config: &DirectConfig) -> Self {
        DirectManager { hosts: config.hosts.clone() }
    }

    /// Applies the host mapping. A full `host:port` key wins over a bare
    /// host key; the mapped value always replaces the whole address.
    fn map_addr(&self, addr: &str) -> String {
        if let Some(mapped) = self.hosts.get(addr) {
            return mapped.clone();
        }
        if let Some((host, _port)) = addr.rsplit_once(':') {
            if let Some(mapped) = self.hosts.get(host) {
                return mapped.clone();
            }
        }
        addr.to_string()
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, BackendError> {
        let real = self.map_addr(addr);
        TcpStream::connect(&real).await.map_err(BackendError::Connect)
    }

    async fn fetch(
        &self,
        session: &SessionHandle,
        mut req: HttpRequestEvent,
    ) -> Result<Option<Box<dyn Event>>, BackendError> {
        let addr = match http::target_address(&req) {
            Some(addr) => addr,
            None => return Err(BackendError::Closed),
        };
        debug!(session = session.id, %addr, "direct fetch");
        let stream = self.connect(&addr).await?;

        // Origin servers expect a path, not the proxy's absolute URL.
        if let Some(rest) = req.url.strip_prefix("http://") {
            let path_start = rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
            req.url = path_start.to_string();
        }
        req.remove_header("Proxy-Connection");

        let hash = req.hash;
        let (rd, mut wr) = stream.into_split();
        wr.write_all(&req.to_raw())
            .await
            .map_err(BackendError::Connect)?;
        let mut reader = BufReader::new(rd);
        let response = http::read_response(&mut reader, hash)
            .await
            .map_err(BackendError::Connect)?;
        Ok(Some(Box::new(response)))
    }
}

#[async_trait]
impl ConnectionManager for DirectManager {
    fn name(&self) -> &str {
        MANAGER_NAME
    }

    async fn request(
        &self,
        session: &SessionHandle,
        ev: Box<dyn Event>,
    ) -> Result<Option<Box<dyn Event>>, BackendError> {
        let ev = unwrap_event(ev);
        // Unbox before awaiting; the downcast error half is not Send.
        let req = match ev.into_any().downcast::<HttpRequestEvent>() {
            Ok(req) => *req,
            // Everything else is write-only traffic with no reply of its own.
            Err(_) => return Ok(None),
        };
        self.fetch(session, req).await
    }

    async fn open_tunnel(
        &self,
        session: &SessionHandle,
        addr: &str,
    ) -> Result<TunnelHandle, BackendError> {
        let stream = self.connect(addr).await?;
        debug!(session = session.id, %addr, "direct tunnel open");

        let (tx_up, mut rx_up) = mpsc::channel::<Vec<u8>>(TUNNEL_CHANNEL_DEPTH);
        let (tx_down, rx_down) = mpsc::channel::<Vec<u8>>(TUNNEL_CHANNEL_DEPTH);

        let session_id = session.id;
        tokio::spawn(async move {
            let (mut rd, mut wr) = stream.into_split();

            let upstream = async {
                while let Some(bytes) = rx_up.recv().await {
                    wr.write_all(&bytes).await?;
                }
                wr.shutdown().await
            };
            let downstream = async {
                let mut buf = vec![0u8; TUNNEL_READ_BUFFER];
                loop {
                    let n = rd.read(&mut buf).await?;
                    if n == 0 {
                        return Ok::<(), io::Error>(());
                    }
                    if tx_down.send(buf[..n].to_vec()).await.is_err() {
                        return Ok(());
                    }
                }
            };

            if let Err(error) = try_join!(upstream, downstream) {
                debug!(session = session_id, %error, "direct tunnel ended");
            }
        });

        Ok(TunnelHandle { tx: tx_up, rx: rx_down })
    }

    async fn close_session(&self, _session: &SessionHandle) {
        // Tunnel tasks end on their own when the session drops its channels.
    }
}
