//! Client-facing half of a proxied connection.
//!
//! A connection bootstraps through a small state machine before any
//! upstream exists: an optional PROXY-protocol preamble, an optional
//! intercepted `ApiVersions` exchange, then the first real request, which is
//! buffered (exactly one frame, ever) while the `NetFilter` picks the
//! upstream and the broker connection comes up. From then on the task pumps
//! frames: decode, filter chain, encode upstream.
//!
//! Backpressure needs no extra machinery here: the task reads the next
//! inbound frame only after the previous one has been written (and flushed)
//! upstream, so a slow broker propagates straight back to the client's TCP
//! window, with never more than the single in-flight frame held in memory.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use kafka_protocol::messages::{ApiKey, RequestKind};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::config::ProxyConfig;
use crate::proxy::api_versions;
use crate::proxy::backend::{self, BrokerWriter, ClientWriter, UpstreamSender};
use crate::proxy::cluster::{
    connect_upstream, ConnectionInfo, NetFilter, VirtualCluster,
};
use crate::proxy::codec::{
    CorrelationManager, RequestDecoder, RequestEncoder, ResponseDecoder, ResponseEncoder,
    SaslDecodePredicate, SharedCorrelation, UpstreamRequest,
};
use crate::proxy::error::{ProxyError, Result};
use crate::proxy::filter::chain::RequestChainOutcome;
use crate::proxy::filter::{FilterChain, SubRequestSender};
use crate::proxy::frame::{RequestFrame, ResponseFrame};

/// Bootstrap states of the client-facing connection.
///
/// ```text
/// Start ──► HaProxy ──► ApiVersions ──► Connecting ──► Connected ──► OutboundActive
///   │          │             │                │
///   └──────────┴─────────────┴───► Failed ◄───┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing received yet.
    Start,
    /// A PROXY-protocol preamble has been received.
    HaProxy,
    /// An `ApiVersions` request has been answered locally.
    ApiVersions,
    /// The first real request is buffered; upstream selection is running.
    Connecting,
    /// The upstream TCP (and TLS) connection is up.
    Connected,
    /// The outbound pipeline is active and the buffered request flushed.
    OutboundActive,
    /// Terminal.
    Failed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Start => "Start",
            SessionState::HaProxy => "HaProxy",
            SessionState::ApiVersions => "ApiVersions",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::OutboundActive => "OutboundActive",
            SessionState::Failed => "Failed",
        }
    }
}

/// Events driving the bootstrap state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A PROXY-protocol preamble arrived.
    Preamble,
    /// An `ApiVersions` request arrived and was answered locally.
    ApiVersionsIntercepted,
    /// A request arrived that needs an upstream; it becomes the single
    /// buffered frame.
    BufferFirstRequest,
    /// The upstream TCP connect (and TLS handshake) succeeded.
    UpstreamConnected,
    /// The outbound pipeline is in place.
    UpstreamActive,
}

/// The pure transition function. Anything not listed is illegal and names
/// the state it happened in.
pub fn transition(state: SessionState, event: SessionEvent) -> Result<SessionState> {
    use SessionEvent::*;
    use SessionState::*;
    match (state, event) {
        (Start, Preamble) => Ok(HaProxy),
        (Start | HaProxy, ApiVersionsIntercepted) => Ok(ApiVersions),
        (Start | HaProxy | ApiVersions, BufferFirstRequest) => Ok(Connecting),
        (Connecting, UpstreamConnected) => Ok(Connected),
        (Connected, UpstreamActive) => Ok(OutboundActive),
        (state, event) => Err(ProxyError::illegal_state(
            state.name(),
            format!("unexpected {event:?}"),
        )),
    }
}

/// Whether the connection should keep running after a frame was handled.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Handle one client connection for its whole lifetime.
pub async fn handle_connection(
    client: TcpStream,
    cluster: VirtualCluster,
    net_filter: Arc<dyn NetFilter>,
    config: ProxyConfig,
) -> Result<()> {
    let peer = client.peer_addr()?;
    let local = client.local_addr()?;
    client.set_nodelay(true)?;

    let (client_read, client_write) = client.into_split();
    let mut client_reader = FramedRead::new(
        client_read,
        RequestDecoder::new(
            SaslDecodePredicate::new(config.authentication_offload),
            config.max_frame_size,
        ),
    );
    let client_writer: ClientWriter =
        Arc::new(Mutex::new(FramedWrite::new(client_write, ResponseEncoder)));

    let mut info = ConnectionInfo {
        virtual_cluster: cluster.name.clone(),
        channel: format!("client {peer} -> {local}"),
        src_address: Some(peer),
        local_address: Some(local),
        ..ConnectionInfo::default()
    };

    let mut state = SessionState::Start;

    // Bootstrap: consume messages until one needs an upstream.
    let buffered = loop {
        let Some(message) = client_reader.next().await else {
            debug!("client closed before selecting an upstream");
            return Ok(());
        };
        match message.map_err(|e| fail(&mut state, e))? {
            crate::proxy::codec::ClientMessage::HaProxy(preamble) => {
                state = transition(state, SessionEvent::Preamble)
                    .map_err(|e| fail(&mut state, e))?;
                trace!(source = ?preamble.source, "PROXY preamble");
                info.proxy_source = preamble.source;
            }
            crate::proxy::codec::ClientMessage::Request(frame) => {
                stash_client_software(&mut info, &frame);
                let offloadable = config.authentication_offload
                    && frame.api_key() == ApiKey::ApiVersions as i16
                    && matches!(state, SessionState::Start | SessionState::HaProxy);
                if offloadable {
                    state = transition(state, SessionEvent::ApiVersionsIntercepted)
                        .map_err(|e| fail(&mut state, e))?;
                    debug!(
                        correlation_id = frame.correlation_id(),
                        "answering ApiVersions locally"
                    );
                    client_writer
                        .lock()
                        .await
                        .send(ResponseFrame::Decoded(api_versions::canned_frame(
                            frame.api_version(),
                            frame.correlation_id(),
                        )))
                        .await?;
                } else {
                    state = transition(state, SessionEvent::BufferFirstRequest)
                        .map_err(|e| fail(&mut state, e))?;
                    break frame;
                }
            }
        }
    };

    // One buffered frame, by construction: reading stopped the moment the
    // frame was taken, and the state machine rejects a second buffer event.
    let target = net_filter.select_server(&info).await?;
    debug!(
        host = %target.host,
        port = target.port,
        filters = target.filters.len(),
        "upstream selected"
    );

    let stream = match connect_upstream(
        &cluster,
        &target.host,
        target.port,
        config.connect_timeout(),
    )
    .await
    {
        Ok(stream) => stream,
        Err(e) => {
            // Connect failure closes the inbound side; nothing was promised
            // to the client yet.
            return Err(fail(&mut state, e));
        }
    };
    state = transition(state, SessionEvent::UpstreamConnected)?;

    // Outbound pipeline: correlation table, codecs, filter chain. The
    // decode predicate flips to the chain's subscriptions the moment the
    // filter list is fixed.
    let correlation: SharedCorrelation =
        Arc::new(parking_lot::Mutex::new(CorrelationManager::new()));
    let (broker_read, broker_write) = tokio::io::split(stream);
    let broker_writer: BrokerWriter = Arc::new(Mutex::new(FramedWrite::new(
        broker_write,
        RequestEncoder::new(Arc::clone(&correlation)),
    )));
    let broker_reader = FramedRead::new(
        broker_read,
        ResponseDecoder::new(Arc::clone(&correlation), config.max_frame_size),
    );

    let sub_sender: Arc<dyn SubRequestSender> =
        Arc::new(UpstreamSender::new(Arc::clone(&broker_writer)));
    let chain = FilterChain::new(
        target.filters,
        info.clone(),
        sub_sender,
        config.filter_timeout(),
    );
    client_reader
        .decoder_mut()
        .predicate_mut()
        .install_delegate(chain.subscriptions());
    let chain = Arc::new(Mutex::new(chain));

    let mut backend_task = tokio::spawn(backend::run(
        broker_reader,
        Arc::clone(&client_writer),
        Arc::clone(&chain),
        Arc::clone(&correlation),
        cluster.log_frames,
    ));

    state = transition(state, SessionEvent::UpstreamActive)?;

    let result = drive(
        &mut client_reader,
        &client_writer,
        &broker_writer,
        &chain,
        &mut backend_task,
        buffered,
        cluster.log_frames,
        &mut state,
    )
    .await;

    backend_task.abort();
    let _ = client_writer.lock().await.close().await;
    result
}

/// Pump frames once the outbound side is active. Returns when either side
/// closes or fails.
#[allow(clippy::too_many_arguments)]
async fn drive(
    client_reader: &mut FramedRead<tokio::net::tcp::OwnedReadHalf, RequestDecoder>,
    client_writer: &ClientWriter,
    broker_writer: &BrokerWriter,
    chain: &Arc<Mutex<FilterChain>>,
    backend_task: &mut tokio::task::JoinHandle<Result<()>>,
    buffered: RequestFrame,
    log_frames: bool,
    state: &mut SessionState,
) -> Result<()> {
    // The buffered request goes first, before inbound reads resume.
    match forward_request(buffered, client_writer, broker_writer, chain, log_frames).await {
        Ok(Flow::Continue) => {}
        Ok(Flow::Close) => return Ok(()),
        Err(e) => return Err(fail(state, e)),
    }

    loop {
        tokio::select! {
            message = client_reader.next() => match message {
                None => {
                    debug!("client closed the connection");
                    // Flush whatever the broker still owes us nothing for;
                    // the write side closes after pending writes drain.
                    let _ = broker_writer.lock().await.close().await;
                    return Ok(());
                }
                Some(Err(e)) => return Err(fail(state, e)),
                Some(Ok(crate::proxy::codec::ClientMessage::HaProxy(_))) => {
                    return Err(fail(state, ProxyError::illegal_state(
                        state.name(),
                        "PROXY preamble after session start".to_string(),
                    )));
                }
                Some(Ok(crate::proxy::codec::ClientMessage::Request(frame))) => {
                    if frame.api_key() == ApiKey::SaslAuthenticate as i16 {
                        // The force-decode window for the SASL exchange ends
                        // with the authenticate request.
                        client_reader.decoder_mut().predicate_mut().handshake_complete();
                    }
                    match forward_request(frame, client_writer, broker_writer, chain, log_frames).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => return Ok(()),
                        Err(e) => return Err(fail(state, e)),
                    }
                }
            },
            joined = &mut *backend_task => {
                return match joined {
                    Ok(Ok(())) => {
                        debug!("upstream finished; closing client");
                        Ok(())
                    }
                    Ok(Err(e)) => Err(fail(state, e)),
                    Err(e) => Err(fail(state, ProxyError::upstream_closed(format!(
                        "backend task failed: {e}"
                    )))),
                };
            }
        }
    }
}

/// Run one request frame through the chain (when decoded) and onward.
async fn forward_request(
    frame: RequestFrame,
    client_writer: &ClientWriter,
    broker_writer: &BrokerWriter,
    chain: &Arc<Mutex<FilterChain>>,
    log_frames: bool,
) -> Result<Flow> {
    if log_frames {
        debug!(
            api_key = frame.api_key(),
            api_version = frame.api_version(),
            correlation_id = frame.correlation_id(),
            "request from client"
        );
    }

    match frame {
        RequestFrame::Decoded(decoded) => {
            let outcome = chain.lock().await.on_request(decoded).await?;
            match outcome {
                RequestChainOutcome::Forward(frame) => {
                    broker_writer
                        .lock()
                        .await
                        .send(UpstreamRequest::Forward(RequestFrame::Decoded(frame)))
                        .await?;
                    Ok(Flow::Continue)
                }
                RequestChainOutcome::ShortCircuit { frame, close } => {
                    if let Some(frame) = frame {
                        client_writer
                            .lock()
                            .await
                            .send(ResponseFrame::Decoded(frame))
                            .await?;
                    }
                    if close {
                        Ok(Flow::Close)
                    } else {
                        Ok(Flow::Continue)
                    }
                }
                RequestChainOutcome::Drop => Ok(Flow::Continue),
            }
        }
        opaque => {
            broker_writer
                .lock()
                .await
                .send(UpstreamRequest::Forward(opaque))
                .await?;
            Ok(Flow::Continue)
        }
    }
}

/// Record a failure: transition to `Failed`, log, and pass the error on.
fn fail(state: &mut SessionState, error: ProxyError) -> ProxyError {
    if *state != SessionState::Failed {
        if error.is_disconnect() {
            debug!(state = state.name(), %error, "connection ended");
        } else {
            warn!(state = state.name(), %error, "connection failed");
        }
        *state = SessionState::Failed;
    }
    error
}

fn stash_client_software(info: &mut ConnectionInfo, frame: &RequestFrame) {
    if let RequestFrame::Decoded(frame) = frame {
        if let RequestKind::ApiVersions(body) = &frame.body {
            if !body.client_software_name.is_empty() {
                info.client_software_name = Some(body.client_software_name.to_string());
            }
            if !body.client_software_version.is_empty() {
                info.client_software_version = Some(body.client_software_version.to_string());
            }
        }
    }
}
