//! Capability descriptor exchange.
//!
//! The responder writes one JSON document and half-closes; end-of-stream is
//! the only delimiter. A requester therefore cannot tell a slow peer from a
//! finished one, and the read deadline is the sole guard against a stalled
//! responder. A length prefix would remove the ambiguity but breaks
//! compatibility with existing peers, so the framing stays as it is.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use futures::{
    StreamExt,
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};
use libp2p::PeerId;
use libp2p_stream::IncomingStreams;
use thiserror::Error;
use tokio::sync::watch;

use crate::{
    protocol::{self, MAX_METADATA_SIZE},
    traits::MetadataFetcher,
    types::Resource,
};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("opening metadata stream: {0}")]
    Open(String),
    #[error("reading metadata stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("no complete metadata within {0:?}")]
    Timeout(Duration),
    #[error("peer closed the stream without sending metadata")]
    Empty,
    #[error("metadata exceeds {MAX_METADATA_SIZE} bytes")]
    TooLarge,
    #[error("decoding metadata: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("metadata is {age_secs}s old")]
    Stale { age_secs: i64 },
}

// ─── Wire format ────────────────────────────────────────────────────────────

/// Read everything up to end-of-stream, refusing payloads above `limit` bytes.
pub async fn read_to_eof(
    stream: &mut (impl AsyncRead + Unpin),
    limit: usize,
) -> Result<Vec<u8>, MetadataError> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut buf = Vec::new();
    (&mut *stream).take(cap).read_to_end(&mut buf).await?;
    match (buf.is_empty(), buf.len() > limit) {
        (true, _) => Err(MetadataError::Empty),
        (false, true) => Err(MetadataError::TooLarge),
        (false, false) => Ok(buf),
    }
}

/// Read and decode a descriptor, giving up once `deadline` elapses.
pub async fn read_payload(
    stream: &mut (impl AsyncRead + Unpin),
    deadline: Duration,
) -> Result<Resource, MetadataError> {
    let bytes = tokio::time::timeout(deadline, read_to_eof(stream, MAX_METADATA_SIZE))
        .await
        .map_err(|_| MetadataError::Timeout(deadline))??;
    Ok(Resource::from_json(&bytes)?)
}

/// Write the descriptor and half-close the stream.
pub async fn write_payload(
    stream: &mut (impl AsyncWrite + Unpin),
    resource: &Resource,
) -> Result<(), MetadataError> {
    let data = resource.to_json()?;
    stream.write_all(&data).await?;
    stream.close().await?;
    Ok(())
}

pub fn ensure_fresh(resource: &Resource, max_age: Duration) -> Result<(), MetadataError> {
    let now = Utc::now();
    match resource.is_fresh(max_age, now) {
        true => Ok(()),
        false => Err(MetadataError::Stale {
            age_secs: resource.age(now).num_seconds(),
        }),
    }
}

/// Fetch a descriptor and reject it when it is older than `max_age`.
pub async fn fetch_fresh(
    fetcher: &dyn MetadataFetcher,
    peer: PeerId,
    deadline: Duration,
    max_age: Duration,
) -> Result<Resource, MetadataError> {
    let resource = fetcher.fetch(peer, deadline).await?;
    ensure_fresh(&resource, max_age)?;
    Ok(resource)
}

// ─── Responder ──────────────────────────────────────────────────────────────

/// Answer every inbound metadata stream with the current local descriptor.
///
/// The request side is never read and the requester is not authenticated.
pub async fn serve(mut incoming: IncomingStreams, descriptor: watch::Receiver<Arc<Resource>>) {
    while let Some((peer_id, mut stream)) = incoming.next().await {
        let resource = descriptor.borrow().clone();
        tokio::spawn(async move {
            match write_payload(&mut stream, &resource).await {
                Ok(()) => tracing::debug!(%peer_id, "served metadata"),
                Err(e) => tracing::debug!(%peer_id, error = %e, "serving metadata failed"),
            }
        });
    }
    tracing::debug!("metadata responder stopped");
}

// ─── Requester ──────────────────────────────────────────────────────────────

/// Fetches descriptors over libp2p streams, dialing the peer if needed.
#[derive(Clone)]
pub struct StreamFetcher {
    control: libp2p_stream::Control,
}

impl StreamFetcher {
    pub fn new(control: libp2p_stream::Control) -> Self {
        Self { control }
    }
}

#[async_trait]
impl MetadataFetcher for StreamFetcher {
    async fn fetch(&self, peer: PeerId, deadline: Duration) -> Result<Resource, MetadataError> {
        let mut control = self.control.clone();
        tracing::debug!(%peer, protocol = protocol::METADATA_PROTOCOL, "requesting metadata");

        let mut stream = tokio::time::timeout(
            deadline,
            control.open_stream(peer, protocol::metadata_protocol()),
        )
        .await
        .map_err(|_| MetadataError::Timeout(deadline))?
        .map_err(|e| MetadataError::Open(e.to_string()))?;

        let result = read_payload(&mut stream, deadline).await;
        if let Err(e) = stream.close().await {
            tracing::debug!(%peer, error = %e, "closing metadata stream");
        }

        let resource = result?.with_peer_id(&peer);
        tracing::debug!(
            %peer,
            gpu_model = %resource.gpu_model,
            vram_gb = resource.vram_gb,
            tokens_throughput = resource.tokens_throughput,
            "received metadata"
        );
        Ok(resource)
    }
}
