//! Moving a key range between replicas.
//!
//! A receiver opens with one clear-to-send per quota of chunks, and the sender
//! streams at most that many chunks before waiting for the next grant. Either
//! side gives up after two keep-alive periods without hearing from the other.
//!
//! Every transfer is a task with the lifecycle
//! create -> start -> run -> stop -> disconnect -> destroy. The task reports
//! the end of its run exactly once through a promise, then keeps its bindings
//! until the owner stops it, and finally reports `Stopped` after releasing
//! them.

use std::{fmt, future::Future};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::Config,
    key::{Key, KeyRange, Position, VersionId},
    model::{EventSender, EventSource, PromiseSender, Transport},
    op::OpId,
    store::{submit, RangeReq, StorageRequest, StorageResponse, StoreHandle},
    Addr,
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl TransferId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({:08x})", self.0)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Where the transferred state sits in the sender's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Log position the transferred state reflects.
    pub snapshot_id: Option<Position>,
    /// Version id in effect after the reconfiguration.
    pub version_id: Option<VersionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateTransfer {
    pub id: TransferId,
    pub source: Addr,
    pub range: KeyRange,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferMessage {
    Initiate(InitiateTransfer),
    ClearToSend {
        id: TransferId,
        quota: usize,
    },
    Data {
        id: TransferId,
        chunk: u32,
        /// bincode of `Vec<(Key, Vec<u8>)>`
        payload: Bytes,
        last: bool,
    },
}

impl TransferMessage {
    pub fn id(&self) -> TransferId {
        match self {
            Self::Initiate(initiate) => initiate.id,
            Self::ClearToSend { id, .. } | Self::Data { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Send,
    Receive,
}

/// End of a transfer's run.
#[derive(Debug)]
pub struct Completed {
    pub id: TransferId,
    pub role: Role,
    pub outcome: crate::Result<Metadata>,
}

/// A transfer released its bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped(pub TransferId);

/// Owner side of a transfer task.
#[derive(Debug)]
pub struct TransferHandle {
    pub id: TransferId,
    pub role: Role,
    sender: EventSender<TransferMessage>,
    stop: CancellationToken,
}

impl TransferHandle {
    pub fn new(
        id: TransferId,
        role: Role,
        sender: EventSender<TransferMessage>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            id,
            role,
            sender,
            stop,
        }
    }

    pub fn deliver(&self, message: TransferMessage) -> crate::Result<()> {
        self.sender.send(message)
    }

    pub fn stop(&self) {
        self.stop.cancel()
    }
}

pub async fn transfer_lifecycle<E>(
    id: TransferId,
    role: Role,
    run: impl Future<Output = crate::Result<Metadata>>,
    completed: PromiseSender<Completed>,
    stop: CancellationToken,
    events: EventSender<E>,
) -> crate::Result<()>
where
    Stopped: Into<E>,
{
    debug!("transfer {id} ({role:?}) started");
    let mut run = Box::pin(run);
    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        () = stop.cancelled() => Err(crate::err!("transfer {id} stopped before completion")),
    };
    if completed.resolve(Completed { id, role, outcome }).is_err() {
        debug!("transfer {id} completion not observed")
    }
    stop.cancelled().await;
    // disconnect network, timer and storage bindings
    drop(run);
    debug!("transfer {id} disconnected");
    if events.send(Stopped(id).into()).is_err() {
        debug!("transfer {id} outlived its owner")
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub id: TransferId,
    pub recipient: Addr,
    pub range: KeyRange,
    pub metadata: Metadata,
}

type Entries = Vec<(Key, Vec<u8>)>;

/// Streams the state of `outbound.range` as of the version before
/// `metadata.version_id`.
pub async fn send_data(
    outbound: Outbound,
    store: StoreHandle,
    transport: impl Transport<TransferMessage>,
    mut source: EventSource<TransferMessage>,
    config: Config,
) -> crate::Result<Metadata> {
    let Outbound {
        id,
        recipient,
        range,
        metadata,
    } = outbound;
    let Some(version) = metadata.version_id else {
        crate::bail!("transfer {id} has no version to capture")
    };
    let request = RangeReq {
        max_version: version.saturating_sub(1),
        ..RangeReq::read(OpId::random(), range.clone())
    };
    let StorageResponse::Range(resp) = submit(&store, StorageRequest::RangeScan(request)).await?
    else {
        crate::bail!("transfer {id} failed to capture {range:?}")
    };
    let entries = resp.results.into_iter().collect::<Entries>();
    let chunks = entries
        .chunks(config.transfer_chunk_entries.max(1))
        .collect::<Vec<_>>();
    info!(
        "transfer {id}: send {} entries in {} chunks to {recipient}",
        entries.len(),
        chunks.len().max(1)
    );

    let initiate = InitiateTransfer {
        id,
        source: transport.addr(),
        range,
        metadata,
    };
    transport
        .send_to(recipient.clone(), TransferMessage::Initiate(initiate))
        .await?;
    let mut next = 0;
    loop {
        let message = timeout(config.transfer_timeout(), source.next())
            .await
            .map_err(|_| crate::err!("transfer {id} timed out waiting for clear-to-send"))??;
        let TransferMessage::ClearToSend { quota, .. } = message else {
            debug!("transfer {id}: unexpected {message:?}");
            continue;
        };
        for _ in 0..quota {
            let chunk = chunks.get(next).copied().unwrap_or_default();
            let last = next + 1 >= chunks.len();
            let data = TransferMessage::Data {
                id,
                chunk: next as u32,
                payload: bincode::serialize(chunk)?.into(),
                last,
            };
            transport.send_to(recipient.clone(), data).await?;
            next += 1;
            if last {
                return Ok(metadata);
            }
        }
    }
}

/// Waits for an initiation and writes the received state one version below
/// the transferred version id.
pub async fn receive_data(
    store: StoreHandle,
    transport: impl Transport<TransferMessage>,
    mut source: EventSource<TransferMessage>,
    config: Config,
) -> crate::Result<Metadata> {
    let initiate = loop {
        match source.next().await? {
            TransferMessage::Initiate(initiate) => break initiate,
            message => debug!("receive: unexpected {message:?} before initiation"),
        }
    };
    let InitiateTransfer {
        id,
        source: sender,
        range,
        metadata,
    } = initiate;
    // incomplete metadata is rejected by the owner
    let (Some(snapshot), Some(version)) = (metadata.snapshot_id, metadata.version_id) else {
        return Ok(metadata);
    };
    info!("transfer {id}: receive {range:?} from {sender} at snapshot {snapshot}");

    let mut granted = 0;
    let mut received = 0;
    loop {
        if granted == 0 {
            granted = config.transfer_quota.max(1);
            let clear = TransferMessage::ClearToSend { id, quota: granted };
            transport.send_to(sender.clone(), clear).await?;
        }
        let message = timeout(config.transfer_timeout(), source.next())
            .await
            .map_err(|_| crate::err!("transfer {id} timed out waiting for data"))??;
        let TransferMessage::Data {
            id: data_id,
            payload,
            last,
            ..
        } = message
        else {
            debug!("transfer {id}: unexpected {message:?}");
            continue;
        };
        if data_id != id {
            debug!("transfer {id}: data of {data_id} ignored");
            continue;
        }
        let entries = bincode::deserialize::<Entries>(&payload)?;
        received += entries.len();
        let requests = entries
            .into_iter()
            .map(|(key, data)| StorageRequest::Put {
                key,
                data,
                version: version.saturating_sub(1),
            })
            .collect();
        submit(
            &store,
            StorageRequest::Snapshot {
                position: snapshot,
                requests,
            },
        )
        .await?;
        granted -= 1;
        if last {
            info!("transfer {id}: received {received} entries");
            return Ok(metadata);
        }
    }
}
