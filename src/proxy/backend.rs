//! Broker-facing half of a proxied connection.
//!
//! The backend task reads response frames from the broker, pairs them with
//! the correlation table, fulfills sub-request promises, runs surviving
//! responses through the filter chain in reverse, and writes them to the
//! client. When the broker side dies, every outstanding promise is failed
//! and the client side is flushed and closed by the frontend.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::proxy::cluster::BrokerStream;
use crate::proxy::codec::{
    BrokerMessage, RequestEncoder, ResponseDecoder, ResponseEncoder, ResponsePromise,
    SharedCorrelation, UpstreamRequest,
};
use crate::proxy::error::{ProxyError, Result};
use crate::proxy::filter::chain::ResponseChainOutcome;
use crate::proxy::filter::{FilterChain, SubRequestSender};
use crate::proxy::frame::{DecodedRequestFrame, ResponseFrame};

/// Writer toward the broker, shared by the frontend pump and filter
/// sub-requests.
pub(crate) type BrokerWriter =
    Arc<Mutex<FramedWrite<WriteHalf<BrokerStream>, RequestEncoder>>>;

/// Writer toward the client, shared by the backend pump and the frontend's
/// short-circuit and offload paths.
pub(crate) type ClientWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, ResponseEncoder>>>;

/// Routes filter sub-requests onto the broker writer.
pub(crate) struct UpstreamSender {
    writer: BrokerWriter,
}

impl UpstreamSender {
    pub(crate) fn new(writer: BrokerWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl SubRequestSender for UpstreamSender {
    async fn send_internal(
        &self,
        frame: DecodedRequestFrame,
        promise: ResponsePromise,
    ) -> Result<()> {
        self.writer
            .lock()
            .await
            .send(UpstreamRequest::Internal { frame, promise })
            .await
    }
}

/// Drive the broker-to-client direction until the upstream closes or fails.
///
/// Always cancels outstanding correlation entries on the way out so pending
/// sub-request promises fail instead of hanging.
pub(crate) async fn run(
    broker_reader: FramedRead<ReadHalf<BrokerStream>, ResponseDecoder>,
    client_writer: ClientWriter,
    chain: Arc<Mutex<FilterChain>>,
    correlation: SharedCorrelation,
    log_frames: bool,
) -> Result<()> {
    let result = pump(broker_reader, client_writer, chain, log_frames).await;
    correlation.lock().cancel_all("upstream connection closed");
    result
}

async fn pump(
    mut broker_reader: FramedRead<ReadHalf<BrokerStream>, ResponseDecoder>,
    client_writer: ClientWriter,
    chain: Arc<Mutex<FilterChain>>,
    log_frames: bool,
) -> Result<()> {
    while let Some(message) = broker_reader.next().await {
        let BrokerMessage { frame, promise } = message?;
        if log_frames {
            debug!(
                api_key = frame.api_key(),
                correlation_id = frame.correlation_id(),
                internal = promise.is_some(),
                "response from upstream"
            );
        }

        // Sub-request responses resolve their promise and go no further
        // downstream.
        if let Some(promise) = promise {
            match frame {
                ResponseFrame::Decoded(frame) => {
                    let _ = promise.send(Ok(frame));
                }
                ResponseFrame::Opaque(frame) => {
                    let _ = promise.send(Err(ProxyError::malformed(format!(
                        "sub-request response for api {} arrived opaque",
                        frame.api_key
                    ))));
                }
            }
            continue;
        }

        match frame {
            ResponseFrame::Decoded(decoded) => {
                let outcome = chain.lock().await.on_response(decoded).await?;
                match outcome {
                    ResponseChainOutcome::Forward(frame) => {
                        client_writer
                            .lock()
                            .await
                            .send(ResponseFrame::Decoded(frame))
                            .await?;
                    }
                    ResponseChainOutcome::Drop => {
                        trace!("response dropped by filter chain");
                    }
                    ResponseChainOutcome::Close => {
                        let _ = client_writer.lock().await.close().await;
                        return Ok(());
                    }
                }
            }
            opaque => {
                client_writer.lock().await.send(opaque).await?;
            }
        }
    }

    debug!("upstream closed the connection");
    Ok(())
}
