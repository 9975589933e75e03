use super::tailer::READ_BUFFER_SIZE;
use crate::config::types::{LogSourceConfig, SourceKind, CHAN_SIZE};
use crate::decoder::{Decoder, Payload, SourceContext};
use crate::message::PipelineMessage;
use crate::pipeline::PipelineProvider;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Summons a protocol-specific listener for every configured network
/// source. Network origins carry no identifier, so nothing they emit is
/// tracked by the auditor.
pub struct Listener {
    sources: Vec<(Arc<LogSourceConfig>, mpsc::Sender<PipelineMessage>)>,
}

impl Listener {
    pub fn new(sources: &[Arc<LogSourceConfig>], provider: &mut PipelineProvider) -> Self {
        let sources = sources
            .iter()
            .filter(|source| matches!(source.kind, SourceKind::Tcp | SourceKind::Udp))
            .map(|source| (source.clone(), provider.next_pipeline_chan()))
            .collect();
        Self { sources }
    }

    /// Binds every network source and spawns its accept or datagram loop.
    /// A source that cannot bind is logged and skipped; it never takes the
    /// others down.
    pub async fn start(&mut self, shutdown: watch::Receiver<bool>) {
        for (source, chan) in &self.sources {
            let Some(port) = source.port else { continue };
            let addr = format!("0.0.0.0:{port}");
            match source.kind {
                SourceKind::Tcp => match TcpListener::bind(&addr).await {
                    Ok(listener) => {
                        info!(%addr, "listening for tcp logs");
                        tokio::spawn(run_tcp_source(
                            listener,
                            source.clone(),
                            chan.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(%addr, error = %e, "can't start tcp source"),
                },
                SourceKind::Udp => match UdpSocket::bind(&addr).await {
                    Ok(socket) => {
                        info!(%addr, "listening for udp logs");
                        tokio::spawn(run_udp_source(
                            socket,
                            source.clone(),
                            chan.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(%addr, error = %e, "can't start udp source"),
                },
                _ => {}
            }
        }
    }
}

async fn run_tcp_source(
    listener: TcpListener,
    source: Arc<LogSourceConfig>,
    output: mpsc::Sender<PipelineMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "accepted log connection");
                    tokio::spawn(handle_connection(socket, source.clone(), output.clone()));
                }
                Err(e) => warn!(error = %e, "could not accept log connection"),
            },
            _ = shutdown.changed() => return,
        }
    }
}

/// One decoder per connection; the connection closing (or erroring) closes
/// the decoder input, which drains and winds the forward task down.
async fn handle_connection(
    mut socket: TcpStream,
    source: Arc<LogSourceConfig>,
    output: mpsc::Sender<PipelineMessage>,
) {
    let (payload_tx, payload_rx) = mpsc::channel(CHAN_SIZE);
    let (decoded_tx, decoded_rx) = mpsc::channel(CHAN_SIZE);
    tokio::spawn(Decoder::for_source(&source, payload_rx, decoded_tx).run());
    tokio::spawn(forward_network_messages(decoded_rx, output, source));

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match socket.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                let payload = Payload::new(buf[..n].to_vec(), SourceContext::None);
                if payload_tx.send(payload).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "couldn't read message from connection");
                return;
            }
        }
    }
}

async fn run_udp_source(
    socket: UdpSocket,
    source: Arc<LogSourceConfig>,
    output: mpsc::Sender<PipelineMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (payload_tx, payload_rx) = mpsc::channel(CHAN_SIZE);
    let (decoded_tx, decoded_rx) = mpsc::channel(CHAN_SIZE);
    tokio::spawn(Decoder::for_source(&source, payload_rx, decoded_tx).run());
    tokio::spawn(forward_network_messages(decoded_rx, output, source));

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, _peer)) => {
                    // Each datagram is a single payload.
                    let payload = Payload::new(buf[..n].to_vec(), SourceContext::None);
                    if payload_tx.send(payload).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "couldn't read udp datagram");
                    return;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn forward_network_messages(
    mut decoded_rx: mpsc::Receiver<PipelineMessage>,
    output: mpsc::Sender<PipelineMessage>,
    source: Arc<LogSourceConfig>,
) {
    while let Some(item) = decoded_rx.recv().await {
        match item {
            PipelineMessage::Stop => return,
            PipelineMessage::Log(mut msg) => {
                msg.origin.source = Some(source.clone());
                if output.send(PipelineMessage::Log(msg)).await.is_err() {
                    return;
                }
            }
        }
    }
}
