//! Per-connection session router.
//!
//! Every accepted connection gets a session: the first bytes pick the
//! frontend protocol (SOCKS, HTTPS CONNECT, or plain HTTP), after which the
//! session shuttles between receiving from the client and waiting on the
//! backend manager until either side closes.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use burrow_proto::event::{HttpErrorEvent, HttpRequestEvent, HttpResponseEvent};
use burrow_proto::Event;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace, warn};

use crate::backend::{ConnectionManager, SessionHandle, TunnelHandle};
use crate::error::BackendError;
use crate::http;
use crate::socks;

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

const TUNNEL_READ_BUF: usize = 16 * 1024;

/// Frontend protocol, decided from the first bytes the client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontendProtocol {
    Socks,
    HttpsConnect,
    Http,
}

/// Classifies a connection by its opening bytes. A SOCKS client leads with
/// its version number, which no HTTP method starts with; CONNECT gets its
/// own lane because it switches the session into raw-tunnel mode.
pub fn classify(prefix: &[u8]) -> FrontendProtocol {
    match prefix.first() {
        Some(4) | Some(5) => FrontendProtocol::Socks,
        _ if prefix.len() >= 7 && prefix[..7].eq_ignore_ascii_case(b"CONNECT") => {
            FrontendProtocol::HttpsConnect
        }
        _ => FrontendProtocol::Http,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ReceivingFrontend,
    Dispatching,
    AwaitingBackend,
    Closed,
}

struct Session {
    handle: SessionHandle,
    phase: Phase,
}

impl Session {
    fn new(peer: String) -> Self {
        Session {
            handle: SessionHandle {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                peer,
            },
            phase: Phase::ReceivingFrontend,
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!(session = self.handle.id, from = ?self.phase, to = ?phase, "phase change");
            self.phase = phase;
        }
    }
}

/// Drives one client connection to completion. Generic over the stream so
/// tests can run it over in-memory duplex pipes.
pub async fn serve_connection<S>(
    stream: S,
    peer: String,
    manager: Arc<dyn ConnectionManager>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(peer);
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let prefix = reader.fill_buf().await?;
    if prefix.is_empty() {
        return Ok(());
    }
    let protocol = classify(prefix);
    debug!(
        session = session.handle.id,
        peer = %session.handle.peer,
        manager = manager.name(),
        ?protocol,
        "session opened"
    );

    let result = match protocol {
        FrontendProtocol::Socks => {
            serve_socks(&mut session, &mut reader, &mut writer, &manager).await
        }
        FrontendProtocol::HttpsConnect | FrontendProtocol::Http => {
            serve_http(&mut session, &mut reader, &mut writer, &manager).await
        }
    };

    session.enter(Phase::Closed);
    manager.close_session(&session.handle).await;
    debug!(session = session.handle.id, "session closed");
    result
}

async fn serve_http<R, W>(
    session: &mut Session,
    reader: &mut R,
    writer: &mut W,
    manager: &Arc<dyn ConnectionManager>,
) -> io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        session.enter(Phase::ReceivingFrontend);
        let ev = match http::read_request(reader, session.handle.id).await? {
            Some(ev) => ev,
            None => return Ok(()),
        };

        if ev.method.eq_ignore_ascii_case("CONNECT") {
            return serve_connect(session, reader, writer, manager, ev).await;
        }

        let wants_close = connection_close(&ev.headers);
        session.enter(Phase::Dispatching);
        trace!(session = session.handle.id, method = %ev.method, url = %ev.url, "dispatch");
        let outcome = manager.request(&session.handle, Box::new(ev)).await;
        session.enter(Phase::AwaitingBackend);

        let reply = match outcome {
            Ok(Some(reply)) => reply,
            Ok(None) => continue,
            Err(BackendError::Timeout) => {
                write_response(
                    writer,
                    &http::synthesize(408, "backend request timed out", session.handle.id),
                )
                .await?;
                return Ok(());
            }
            Err(error) => {
                warn!(session = session.handle.id, %error, "backend request failed");
                write_response(
                    writer,
                    &http::synthesize(502, &format!("backend failure: {error}"), session.handle.id),
                )
                .await?;
                return Ok(());
            }
        };

        if let Some(response) = reply.as_any().downcast_ref::<HttpResponseEvent>() {
            let backend_close = connection_close(&response.headers);
            write_response(writer, response).await?;
            if wants_close || backend_close {
                return Ok(());
            }
        } else if let Some(failure) = reply.as_any().downcast_ref::<HttpErrorEvent>() {
            write_response(
                writer,
                &http::synthesize(
                    502,
                    &format!("remote fetch failed: {} ({})", failure.cause, failure.code),
                    session.handle.id,
                ),
            )
            .await?;
            return Ok(());
        } else {
            warn!(
                session = session.handle.id,
                event_type = reply.event_type(),
                "unexpected reply event"
            );
            return Ok(());
        }
    }
}

async fn serve_connect<R, W>(
    session: &mut Session,
    reader: &mut R,
    writer: &mut W,
    manager: &Arc<dyn ConnectionManager>,
    ev: HttpRequestEvent,
) -> io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let addr = match http::target_address(&ev) {
        Some(addr) => addr,
        None => {
            write_response(
                writer,
                &http::synthesize(400, "CONNECT without a target", session.handle.id),
            )
            .await?;
            return Ok(());
        }
    };

    session.enter(Phase::Dispatching);
    let tunnel = match manager.open_tunnel(&session.handle, &addr).await {
        Ok(tunnel) => tunnel,
        Err(error) => {
            warn!(session = session.handle.id, %addr, %error, "tunnel open failed");
            write_response(
                writer,
                &http::synthesize(502, &format!("cannot reach {addr}"), session.handle.id),
            )
            .await?;
            return Ok(());
        }
    };

    writer
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    writer.flush().await?;

    session.enter(Phase::AwaitingBackend);
    run_tunnel(reader, writer, tunnel).await
}

async fn serve_socks<R, W>(
    session: &mut Session,
    reader: &mut R,
    writer: &mut W,
    manager: &Arc<dyn ConnectionManager>,
) -> io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (version, addr) = match socks::read_request(reader, writer).await {
        Ok(request) => request,
        Err(error) => {
            debug!(session = session.handle.id, %error, "SOCKS handshake failed");
            let _ = socks::send_request_error(writer, &error).await;
            return Err(error.into());
        }
    };

    session.enter(Phase::Dispatching);
    let tunnel = match manager.open_tunnel(&session.handle, &addr).await {
        Ok(tunnel) => tunnel,
        Err(error) => {
            warn!(session = session.handle.id, %addr, %error, "tunnel open failed");
            socks::send_failure(writer, version).await?;
            return Ok(());
        }
    };
    socks::send_success(writer, version).await?;

    session.enter(Phase::AwaitingBackend);
    run_tunnel(reader, writer, tunnel).await
}

/// Pumps bytes both ways until the client or the tunnel closes. Any bytes
/// the classifier buffered past the handshake are drained through `reader`
/// first, so pipelined client data is never lost.
async fn run_tunnel<R, W>(reader: &mut R, writer: &mut W, tunnel: TunnelHandle) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let TunnelHandle { tx, mut rx } = tunnel;

    let uplink = async {
        let mut buf = vec![0u8; TUNNEL_READ_BUF];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if tx.send(buf[..n].to_vec()).await.is_err() {
                break;
            }
        }
        drop(tx);
        Ok::<(), io::Error>(())
    };

    let downlink = async {
        while let Some(chunk) = rx.recv().await {
            writer.write_all(&chunk).await?;
            writer.flush().await?;
        }
        writer.shutdown().await?;
        Ok::<(), io::Error>(())
    };

    tokio::try_join!(uplink, downlink)?;
    Ok(())
}

async fn write_response<W>(writer: &mut W, response: &HttpResponseEvent) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.to_raw()).await?;
    writer.flush().await
}

fn connection_close(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(name, value)| {
        (name.eq_ignore_ascii_case("Connection") || name.eq_ignore_ascii_case("Proxy-Connection"))
            && value.eq_ignore_ascii_case("close")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    #[test]
    fn classification() {
        assert_eq!(classify(&[5, 1, 0]), FrontendProtocol::Socks);
        assert_eq!(classify(&[4, 1]), FrontendProtocol::Socks);
        assert_eq!(
            classify(b"CONNECT example.com:443 HTTP/1.1"),
            FrontendProtocol::HttpsConnect
        );
        assert_eq!(
            classify(b"connect example.com:443 HTTP/1.1"),
            FrontendProtocol::HttpsConnect
        );
        assert_eq!(classify(b"GET / HTTP/1.1"), FrontendProtocol::Http);
        assert_eq!(classify(b"CONN"), FrontendProtocol::Http);
    }

    /// Replies to every HTTP request with a canned 200 and echoes tunnels.
    struct EchoManager;

    #[async_trait]
    impl ConnectionManager for EchoManager {
        fn name(&self) -> &str {
            "echo"
        }

        async fn request(
            &self,
            session: &SessionHandle,
            ev: Box<dyn Event>,
        ) -> Result<Option<Box<dyn Event>>, BackendError> {
            let request = ev
                .as_any()
                .downcast_ref::<HttpRequestEvent>()
                .expect("only HTTP requests are dispatched");
            let mut response = http::synthesize(200, &format!("saw {}", request.url), session.id);
            response.set_header("Connection", "close");
            Ok(Some(Box::new(response)))
        }

        async fn open_tunnel(
            &self,
            _session: &SessionHandle,
            _addr: &str,
        ) -> Result<TunnelHandle, BackendError> {
            let (tx_up, mut rx_up) = mpsc::channel::<Vec<u8>>(8);
            let (tx_down, rx_down) = mpsc::channel::<Vec<u8>>(8);
            tokio::spawn(async move {
                while let Some(chunk) = rx_up.recv().await {
                    if tx_down.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
            Ok(TunnelHandle {
                tx: tx_up,
                rx: rx_down,
            })
        }

        async fn close_session(&self, _session: &SessionHandle) {}
    }

    struct FailingManager(BackendError);

    #[async_trait]
    impl ConnectionManager for FailingManager {
        fn name(&self) -> &str {
            "failing"
        }

        async fn request(
            &self,
            _session: &SessionHandle,
            _ev: Box<dyn Event>,
        ) -> Result<Option<Box<dyn Event>>, BackendError> {
            Err(match &self.0 {
                BackendError::Timeout => BackendError::Timeout,
                _ => BackendError::Closed,
            })
        }

        async fn open_tunnel(
            &self,
            _session: &SessionHandle,
            _addr: &str,
        ) -> Result<TunnelHandle, BackendError> {
            Err(BackendError::Closed)
        }

        async fn close_session(&self, _session: &SessionHandle) {}
    }

    #[tokio::test]
    async fn http_request_gets_response() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(
            server,
            "test".to_string(),
            Arc::new(EchoManager),
        ));

        client
            .write_all(
                b"GET http://example.com/page HTTP/1.1\r\nHost: example.com\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 200"), "{text}");
        assert!(text.contains("saw http://example.com/page"), "{text}");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn backend_timeout_becomes_408() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(
            server,
            "test".to_string(),
            Arc::new(FailingManager(BackendError::Timeout)),
        ));

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 408"), "{text}");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn backend_failure_becomes_502() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(
            server,
            "test".to_string(),
            Arc::new(FailingManager(BackendError::Closed)),
        ));

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 502"), "{text}");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_tunnels_bytes() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(
            server,
            "test".to_string(),
            Arc::new(EchoManager),
        ));

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut head = [0u8; 39];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..], b"HTTP/1.1 200 Connection established\r\n\r\n");

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn socks5_tunnels_bytes() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(
            server,
            "test".to_string(),
            Arc::new(EchoManager),
        ));

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0]);

        let mut request = vec![5, 1, 0, 3, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&[0x01, 0xBB]);
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..2], [5, 0]);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        task.await.unwrap().unwrap();
    }
}
