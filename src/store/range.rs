//! Versioned, filtered and limited scans over a [`Persistence`].
//!
//! A scan walks the store in key order starting at the range's lower bound
//! key. For every key it selects the newest version not above the version
//! ceiling, then applies, in order, the transformation filter, the limit and
//! the side-effecting action. The store iterator only lives inside
//! [`scan_entries`], so it is released before the action commits or aborts
//! and before any error reaches the caller.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    key::{Key, KeyRange, VersionId},
    op::OpId,
};

use super::{visible, Persistence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Limit {
    #[default]
    Unlimited,
    /// At most this many result entries.
    Entries(usize),
    /// At most this many result value bytes.
    Bytes(usize),
}

impl Limit {
    pub fn tracker(self) -> LimitTracker {
        LimitTracker {
            limit: self,
            consumed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LimitTracker {
    limit: Limit,
    consumed: usize,
}

impl LimitTracker {
    /// Accounts `value` against the limit. Returns false, without accounting,
    /// if the value does not fit.
    pub fn read(&mut self, value: &[u8]) -> bool {
        let cost = match self.limit {
            Limit::Unlimited => return true,
            Limit::Entries(_) => 1,
            Limit::Bytes(_) => value.len(),
        };
        if !self.can_read() || self.consumed + cost > self.bound() {
            return false;
        }
        self.consumed += cost;
        true
    }

    pub fn can_read(&self) -> bool {
        matches!(self.limit, Limit::Unlimited) || self.consumed < self.bound()
    }

    fn bound(&self) -> usize {
        match self.limit {
            Limit::Unlimited => usize::MAX,
            Limit::Entries(n) | Limit::Bytes(n) => n,
        }
    }
}

/// Decides whether a value is part of the result and what it looks like
/// there.
pub trait TransformationFilter: fmt::Debug + Send + Sync {
    /// `None` drops the entry.
    fn transform(&self, value: &[u8]) -> Option<Vec<u8>>;
}

/// Keeps values starting with the prefix, unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePrefix(pub Vec<u8>);

impl TransformationFilter for ValuePrefix {
    fn transform(&self, value: &[u8]) -> Option<Vec<u8>> {
        value.starts_with(&self.0).then(|| value.to_vec())
    }
}

/// A side effect applied to every entry a scan returns.
pub trait RangeAction: fmt::Debug + Send + Sync {
    /// Starts one execution of the action.
    fn prepare(&self) -> crate::Result<Box<dyn ActionRun>>;
}

/// One execution of a [`RangeAction`]. Runs end with `commit`, with `abort`,
/// or with a failed `commit` followed by `abort`, always after the store
/// iterator is released.
pub trait ActionRun: Send {
    /// Returns the new stored size of the entry: `None` if the entry is left as
    /// it is, `Some(0)` if it is removed.
    fn process(
        &mut self,
        key: &Key,
        value: &[u8],
        version: VersionId,
    ) -> crate::Result<Option<usize>>;

    fn commit(&mut self, store: &mut dyn Persistence) -> crate::Result<()>;

    fn abort(self: Box<Self>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAction;

impl RangeAction for NoopAction {
    fn prepare(&self) -> crate::Result<Box<dyn ActionRun>> {
        Ok(Box::new(NoopAction))
    }
}

impl ActionRun for NoopAction {
    fn process(&mut self, _: &Key, _: &[u8], _: VersionId) -> crate::Result<Option<usize>> {
        Ok(None)
    }

    fn commit(&mut self, _: &mut dyn Persistence) -> crate::Result<()> {
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

/// Removes every returned entry once the scan succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteAction;

impl RangeAction for DeleteAction {
    fn prepare(&self) -> crate::Result<Box<dyn ActionRun>> {
        Ok(Box::<DeleteRun>::default())
    }
}

#[derive(Debug, Default)]
struct DeleteRun(Vec<Key>);

impl ActionRun for DeleteRun {
    fn process(&mut self, key: &Key, _: &[u8], _: VersionId) -> crate::Result<Option<usize>> {
        self.0.push(key.clone());
        Ok(Some(0))
    }

    fn commit(&mut self, store: &mut dyn Persistence) -> crate::Result<()> {
        for key in &self.0 {
            store.delete(key)
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

/// Change of stored bytes and key count caused by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SizeDelta {
    pub bytes: i64,
    pub keys: i64,
}

impl SizeDelta {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct RangeReq {
    pub id: OpId,
    pub range: KeyRange,
    pub limit: Limit,
    pub filter: Option<Arc<dyn TransformationFilter>>,
    pub action: Option<Arc<dyn RangeAction>>,
    /// Version the action stamps its effects with.
    pub action_version: VersionId,
    /// Newest version visible to the scan.
    pub max_version: VersionId,
}

impl RangeReq {
    /// A plain read of everything in `range`.
    pub fn read(id: OpId, range: KeyRange) -> Self {
        Self {
            id,
            range,
            limit: Limit::Unlimited,
            filter: None,
            action: None,
            action_version: 0,
            max_version: VersionId::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeResp {
    pub id: OpId,
    pub results: BTreeMap<Key, Vec<u8>>,
    /// The limit cut the scan short while more results remained.
    pub more: bool,
    pub diff: SizeDelta,
}

pub fn execute(req: &RangeReq, store: &mut dyn Persistence) -> crate::Result<RangeResp> {
    let mut run = match &req.action {
        Some(action) => action.prepare()?,
        None => Box::new(NoopAction),
    };
    let scanned = scan_entries(req, &*store, &mut *run);
    match scanned.and_then(|scanned| run.commit(store).map(|()| scanned)) {
        Ok((results, more, diff)) => Ok(RangeResp {
            id: req.id,
            results,
            more,
            diff,
        }),
        Err(err) => {
            run.abort();
            Err(err)
        }
    }
}

type Scanned = (BTreeMap<Key, Vec<u8>>, bool, SizeDelta);

fn scan_entries(
    req: &RangeReq,
    store: &dyn Persistence,
    run: &mut dyn ActionRun,
) -> crate::Result<Scanned> {
    let mut results = BTreeMap::new();
    let mut diff = SizeDelta::default();
    let mut limit = req.limit.tracker();
    let mut more = false;
    let begin = req.range.begin_key();

    let mut entries = store.iter_from(&begin).filter_map(|(key, versions)| {
        if !req.range.contains_key(key) {
            // an excluded lower bound is skipped rather than ending the scan
            if *key == begin && !req.range.is_past_end(key) {
                return None;
            }
            return Some(None);
        }
        let stored = visible(versions, req.max_version)?;
        let value = match &req.filter {
            Some(filter) => filter.transform(stored)?,
            None => stored.clone(),
        };
        Some(Some((key, stored, value)))
    });
    while let Some(Some((key, stored, value))) = entries.next() {
        if !limit.read(&value) {
            more = true;
            break;
        }
        let new_size = run.process(key, &value, req.action_version)?;
        match new_size {
            Some(0) => {
                diff.bytes -= stored.len() as i64;
                diff.keys -= 1
            }
            Some(size) => diff.bytes -= stored.len() as i64 - size as i64,
            None => {}
        }
        results.insert(key.clone(), value);
        if !limit.can_read() {
            // peek only, the next result is not processed
            more = matches!(entries.next(), Some(Some(_)));
            break;
        }
    }
    Ok((results, more, diff))
}
