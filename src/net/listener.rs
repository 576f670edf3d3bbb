//! Accept loops, outgoing dials, and the per-connection reader and
//! writer tasks.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use tenth_proto::transport::{self, TransportReadError, TransportReader, TransportWriter};

use crate::config::{Config, LinkBlock, PortKind, TlsConfig};
use crate::engine::Event;
use crate::net::NetHandle;
use crate::send::SendQueue;

/// Queue cap before the engine resolves a class.
const INITIAL_SENDQ: usize = 1 << 20;

/// Load the TLS acceptor from the configured PEM material.
pub fn load_tls(tls: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        &tls.cert,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        &tls.key,
    )?))?
    .ok_or_else(|| anyhow::anyhow!("no private key in {}", tls.key))?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Bind every configured listener and spawn its accept loop.
pub async fn start_listeners(config: &Config, handle: NetHandle) -> anyhow::Result<()> {
    for listen in &config.listen {
        let listener = TcpListener::bind(&listen.addr).await?;
        info!(addr = %listen.addr, kind = ?listen.kind, tls = listen.tls, "listening");
        let tls = if listen.tls { handle.tls.clone() } else { None };
        let kind = listen.kind;
        let handle = handle.clone();
        tokio::spawn(async move {
            accept_loop(listener, kind, tls, handle).await;
        });
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    kind: PortKind,
    tls: Option<TlsAcceptor>,
    handle: NetHandle,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let tls = tls.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            let halves = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => transport::tls(tls_stream),
                    Err(e) => {
                        debug!(%addr, error = %e, "TLS handshake failed");
                        return;
                    }
                },
                None => transport::tcp(stream),
            };
            run_connection(handle, halves, addr, kind, None).await;
        });
    }
}

/// Dial a configured link in the background; the engine hears about it
/// as a normal accepted connection with `outgoing_link` set.
pub fn spawn_outgoing(handle: &NetHandle, link: &LinkBlock) {
    let handle = handle.clone();
    let link = link.clone();
    tokio::spawn(async move {
        let target = format!("{}:{}", link.host, link.port);
        match TcpStream::connect(&target).await {
            Ok(stream) => {
                let addr = stream
                    .peer_addr()
                    .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("static addr"));
                let halves = transport::tcp(stream);
                run_connection(handle, halves, addr, PortKind::Server, Some(link.name)).await;
            }
            Err(e) => {
                warn!(link = %link.name, %target, error = %e, "dial failed");
            }
        }
    });
}

/// Announce the connection, then pump bytes both ways until it dies.
async fn run_connection(
    handle: NetHandle,
    halves: (TransportReader, TransportWriter),
    addr: std::net::SocketAddr,
    kind: PortKind,
    outgoing_link: Option<String>,
) {
    let (reader, writer) = halves;
    let id = handle.next_id();
    let sendq = SendQueue::new(INITIAL_SENDQ);

    if handle
        .event_tx
        .send(Event::Accepted {
            id,
            addr,
            kind,
            sendq: sendq.clone(),
            outgoing_link,
        })
        .await
        .is_err()
    {
        return; // engine is gone
    }

    let writer_q = sendq.clone();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = writer_q.next().await {
            if writer.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    read_loop(&handle, id, reader).await;

    // Reader is done; let the writer drain whatever the engine queued
    // (the ERROR line, usually), then fall off.
    sendq.close();
    let _ = writer_task.await;
}

async fn read_loop(handle: &NetHandle, id: crate::conn::ConnId, mut reader: TransportReader) {
    loop {
        match reader.read_line().await {
            Ok(Some(line)) => {
                if handle.event_tx.send(Event::Line { id, line }).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = handle
                    .event_tx
                    .send(Event::Closed {
                        id,
                        reason: "EOF from client".to_string(),
                    })
                    .await;
                return;
            }
            Err(TransportReadError::LineTooLong(_)) => {
                if handle
                    .event_tx
                    .send(Event::OverlongLine { id })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(TransportReadError::Io(e)) => {
                let _ = handle
                    .event_tx
                    .send(Event::Closed {
                        id,
                        reason: format!("Read error: {}", e),
                    })
                    .await;
                return;
            }
        }
    }
}
