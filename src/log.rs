use std::{cmp::Ordering, collections::BTreeMap};

use tracing::warn;

use crate::{
    key::{KeyRange, Position, VersionId},
    model::EventSender,
    op::{OpId, Operation},
    view::View,
    Addr,
};

#[derive(Debug, Clone)]
pub struct Reconfigure {
    pub id: OpId,
    pub view: View,
    pub quorum: usize,
    /// Version id of the proposer when proposing.
    pub version: VersionId,
    pub range: KeyRange,
}

/// Payload of a decided log entry.
#[derive(Debug, Clone)]
pub enum Value {
    Op(Operation),
    Reconfigure(Reconfigure),
    Scan { id: OpId, range: KeyRange },
    SyncedUp { id: OpId },
    Noop { id: OpId },
    /// Decoded from a newer replica, no local meaning.
    Unknown { id: OpId, tag: u32 },
}

impl Value {
    pub fn id(&self) -> OpId {
        match self {
            Self::Op(op) => op.id,
            Self::Reconfigure(reconfigure) => reconfigure.id,
            Self::Scan { id, .. }
            | Self::SyncedUp { id }
            | Self::Noop { id }
            | Self::Unknown { id, .. } => *id,
        }
    }

    pub fn synced_up() -> Self {
        Self::SyncedUp { id: OpId::random() }
    }

    pub fn scan(range: KeyRange) -> Self {
        Self::Scan {
            id: OpId::random(),
            range,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decide {
    pub position: Position,
    pub value: Value,
}

// ordered by position, ties broken by value id
impl PartialEq for Decide {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decide {}

impl PartialOrd for Decide {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decide {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.position, self.value.id()).cmp(&(other.position, other.value.id()))
    }
}

/// Decided values of this replica by position.
///
/// Values are released strictly in position order: a value delivered ahead of
/// a gap waits until the gap is filled, and a position that has already been
/// released is rejected. The first delivered position is where a replica
/// joining mid-log starts.
#[derive(Debug, Default)]
pub struct OperationsLog {
    entries: BTreeMap<Position, Value>,
    pending: BTreeMap<Position, Value>,
    applied: Option<Position>,
}

impl OperationsLog {
    /// Returns the values ready for application, in position order.
    pub fn insert(&mut self, position: Position, value: Value) -> Vec<(Position, Value)> {
        if self.applied.is_some_and(|applied| position <= applied)
            || self.pending.contains_key(&position)
        {
            warn!("reject duplicated decision at {position}: {value:?}");
            return Vec::new();
        }
        self.pending.insert(position, value);
        let mut ready = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if self.applied.is_some_and(|applied| *entry.key() != applied + 1) {
                break;
            }
            let (position, value) = entry.remove_entry();
            self.applied = Some(position);
            self.entries.insert(position, value.clone());
            ready.push((position, value))
        }
        ready
    }

    /// Operations recorded after `position`, in position order.
    pub fn snapshot_diff(
        &self,
        position: Position,
    ) -> impl Iterator<Item = (Position, &Operation)> + '_ {
        self.entries
            .range(position + 1..)
            .filter_map(|(position, value)| match value {
                Value::Op(op) => Some((*position, op)),
                _ => None,
            })
    }

    /// Discards entries at or below `watermark`.
    pub fn prune(&mut self, watermark: Position) {
        self.entries = self.entries.split_off(&(watermark + 1))
    }

    pub fn applied(&self) -> Option<Position> {
        self.applied
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The ordering service the engine submits to.
pub trait ReplicatedLog: Send + 'static {
    fn propose(&self, value: Value) -> crate::Result<()>;

    /// Best effort.
    fn prune(&self, watermark: Position) -> crate::Result<()>;
}

#[derive(Debug)]
pub enum LogCommand {
    Propose(Value),
    Prune { replica: Addr, watermark: Position },
}

#[derive(Debug, Clone)]
pub struct LogHandle {
    pub replica: Addr,
    pub sender: EventSender<LogCommand>,
}

impl ReplicatedLog for LogHandle {
    fn propose(&self, value: Value) -> crate::Result<()> {
        self.sender.send(LogCommand::Propose(value))
    }

    fn prune(&self, watermark: Position) -> crate::Result<()> {
        self.sender.send(LogCommand::Prune {
            replica: self.replica.clone(),
            watermark,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Value {
        Value::Noop { id: OpId::random() }
    }

    fn positions(ready: &[(Position, Value)]) -> Vec<Position> {
        ready.iter().map(|(position, _)| *position).collect::<Vec<_>>()
    }

    #[test]
    fn releases_in_position_order() {
        let mut log = OperationsLog::default();
        assert_eq!(positions(&log.insert(3, noop())), [3]);
        assert!(log.insert(5, noop()).is_empty());
        assert!(log.insert(6, noop()).is_empty());
        assert_eq!(positions(&log.insert(4, noop())), [4, 5, 6]);
        assert_eq!(log.applied(), Some(6));
    }

    #[test]
    fn rejects_duplicates() {
        let mut log = OperationsLog::default();
        log.insert(1, noop());
        log.insert(3, noop());
        assert!(log.insert(1, noop()).is_empty());
        assert!(log.insert(3, noop()).is_empty());
        assert_eq!(positions(&log.insert(2, noop())), [2, 3]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn snapshot_diff_and_prune() {
        let mut log = OperationsLog::default();
        log.insert(1, Value::Op(Operation::put("a", "1")));
        log.insert(2, noop());
        log.insert(3, Value::Op(Operation::put("b", "2")));
        log.insert(4, Value::Op(Operation::get("b")));

        let diff = |log: &OperationsLog, position| {
            log.snapshot_diff(position)
                .map(|(position, _)| position)
                .collect::<Vec<_>>()
        };
        assert_eq!(diff(&log, 1), [3, 4]);

        log.prune(2);
        assert_eq!(log.len(), 2);
        assert_eq!(diff(&log, 0), [3, 4]);
        assert!(diff(&log, 10).is_empty());
    }

    #[test]
    fn decide_order_breaks_ties_by_id() {
        let a = Decide {
            position: 1,
            value: Value::Noop { id: OpId(2) },
        };
        let b = Decide {
            position: 1,
            value: Value::Noop { id: OpId(1) },
        };
        let c = Decide {
            position: 0,
            value: Value::Noop { id: OpId(9) },
        };
        let mut decisions = vec![a, b, c];
        decisions.sort();
        assert_eq!(
            decisions.iter().map(|d| d.value.id()).collect::<Vec<_>>(),
            [OpId(9), OpId(1), OpId(2)]
        );
    }
}
