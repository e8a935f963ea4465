//! Local storage and the storage service the engine talks to.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::{
    key::{Key, KeyRange, Position, VersionId},
    model::{promise_channel, EventSender, EventSource, PromiseSender},
    op::{Condition, OpId},
};

pub mod range;

pub use range::{RangeReq, RangeResp, SizeDelta};

/// All stored versions of one key.
pub type Versions = BTreeMap<VersionId, Vec<u8>>;

/// The newest version not above `ceiling`.
pub fn visible(versions: &Versions, ceiling: VersionId) -> Option<&Vec<u8>> {
    versions.range(..=ceiling).next_back().map(|(_, value)| value)
}

pub trait Persistence: Send {
    fn versions(&self, key: &Key) -> Option<&Versions>;

    fn put(&mut self, key: Key, value: Vec<u8>, version: VersionId);

    /// Removes the key with all its versions.
    fn delete(&mut self, key: &Key);

    fn remove_versions_below(&mut self, key: &Key, version: VersionId);

    /// Entries in key order, starting at the first key not smaller than
    /// `begin`.
    fn iter_from<'a>(&'a self, begin: &Key)
        -> Box<dyn Iterator<Item = (&'a Key, &'a Versions)> + 'a>;

    fn get(&self, key: &Key) -> Option<&Vec<u8>> {
        self.versions(key)?.values().next_back()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore(BTreeMap<Key, Versions>);

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Persistence for MemoryStore {
    fn versions(&self, key: &Key) -> Option<&Versions> {
        self.0.get(key)
    }

    fn put(&mut self, key: Key, value: Vec<u8>, version: VersionId) {
        self.0.entry(key).or_default().insert(version, value);
    }

    fn delete(&mut self, key: &Key) {
        self.0.remove(key);
    }

    fn remove_versions_below(&mut self, key: &Key, version: VersionId) {
        if let Some(versions) = self.0.get_mut(key) {
            *versions = versions.split_off(&version)
        }
    }

    fn iter_from<'a>(
        &'a self,
        begin: &Key,
    ) -> Box<dyn Iterator<Item = (&'a Key, &'a Versions)> + 'a> {
        Box::new(self.0.range(begin.clone()..))
    }
}

#[derive(Debug, Clone)]
pub enum StorageRequest {
    Get {
        id: OpId,
        key: Key,
    },
    Put {
        key: Key,
        data: Vec<u8>,
        version: VersionId,
    },
    RangeScan(RangeReq),
    MultiOp {
        id: OpId,
        conditions: Vec<Condition>,
        success_puts: BTreeMap<Key, Vec<u8>>,
        failure_puts: BTreeMap<Key, Vec<u8>>,
        version: VersionId,
    },
    SizeScan {
        range: KeyRange,
    },
    /// Drops keys outside `range` and history below `version`.
    Cleanup {
        range: KeyRange,
        version: VersionId,
    },
    /// Applies captured writes of the log up to `position`, in order.
    Snapshot {
        position: Position,
        requests: Vec<StorageRequest>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageResponse {
    Get {
        id: OpId,
        key: Key,
        value: Option<Vec<u8>>,
    },
    Range(RangeResp),
    MultiOp {
        id: OpId,
        success: bool,
    },
    Size {
        range: KeyRange,
        bytes: u64,
        keys: u64,
    },
    Snapshot {
        position: Position,
    },
    Failed {
        id: OpId,
    },
    Done,
}

impl StorageResponse {
    pub fn diff(&self) -> Option<SizeDelta> {
        match self {
            Self::Range(resp) if !resp.diff.is_zero() => Some(resp.diff),
            _ => None,
        }
    }
}

pub type StoreHandle = EventSender<(StorageRequest, Option<PromiseSender<StorageResponse>>)>;

pub type StoreSource = EventSource<(StorageRequest, Option<PromiseSender<StorageResponse>>)>;

/// Issues `request` and waits for its response.
pub async fn submit(
    store: &StoreHandle,
    request: StorageRequest,
) -> crate::Result<StorageResponse> {
    let (sender, source) = promise_channel();
    store.send((request, Some(sender)))?;
    Ok(source.await?)
}

pub fn execute(request: StorageRequest, store: &mut dyn Persistence) -> StorageResponse {
    match request {
        StorageRequest::Get { id, key } => {
            let value = store.get(&key).cloned();
            StorageResponse::Get { id, key, value }
        }
        StorageRequest::Put { key, data, version } => {
            store.put(key, data, version);
            StorageResponse::Done
        }
        StorageRequest::RangeScan(req) => match range::execute(&req, store) {
            Ok(resp) => StorageResponse::Range(resp),
            Err(err) => {
                warn!("range scan {} aborted: {err:#}", req.id);
                StorageResponse::Failed { id: req.id }
            }
        },
        StorageRequest::MultiOp {
            id,
            conditions,
            success_puts,
            failure_puts,
            version,
        } => {
            let success = conditions
                .iter()
                .all(|condition| store.get(&condition.key) == condition.expected.as_ref());
            let puts = if success { success_puts } else { failure_puts };
            for (key, data) in puts {
                store.put(key, data, version)
            }
            StorageResponse::MultiOp { id, success }
        }
        StorageRequest::SizeScan { range } => {
            let (mut bytes, mut keys) = (0, 0);
            for (key, versions) in store.iter_from(&range.begin_key()) {
                if range.is_past_end(key) {
                    break;
                }
                if !range.contains_key(key) {
                    continue;
                }
                if let Some(value) = versions.values().next_back() {
                    bytes += value.len() as u64;
                    keys += 1
                }
            }
            StorageResponse::Size { range, bytes, keys }
        }
        StorageRequest::Cleanup { range, version } => {
            cleanup(store, &range, version);
            StorageResponse::Done
        }
        StorageRequest::Snapshot { position, requests } => {
            for request in requests {
                execute(request, store);
            }
            StorageResponse::Snapshot { position }
        }
    }
}

fn cleanup(store: &mut dyn Persistence, range: &KeyRange, version: VersionId) {
    let mut outside = Vec::new();
    let mut collapse = Vec::new();
    for (key, versions) in store.iter_from(&Key::default()) {
        if !range.contains_key(key) {
            outside.push(key.clone());
            continue;
        }
        // the newest version below the floor stays readable
        if let Some((&floor, _)) = versions.range(..version).next_back() {
            if versions.range(..floor).next().is_some() {
                collapse.push((key.clone(), floor))
            }
        }
    }
    debug!(
        "cleanup: remove {} keys, collapse {} histories",
        outside.len(),
        collapse.len()
    );
    for key in outside {
        store.delete(&key)
    }
    for (key, floor) in collapse {
        store.remove_versions_below(&key, floor)
    }
}

/// Executes requests one at a time in arrival order.
pub async fn storage_loop(
    mut store: impl Persistence,
    mut source: StoreSource,
) -> crate::Result<()> {
    while let Some((request, reply)) = source.option_next().await {
        let response = execute(request, &mut store);
        if let Some(reply) = reply {
            if reply.resolve(response).is_err() {
                debug!("storage response dropped by requester")
            }
        }
    }
    Ok(())
}
