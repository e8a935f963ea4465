//! What a decided operation does, per replica state.

use std::fmt;

use tracing::debug;

use crate::{
    key::{Position, VersionId},
    op::{Body, OpKind, Operation, Outcome, Response},
    store::{RangeReq, StorageRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaState {
    /// No view installed yet.
    Passive,
    /// Sending data to new members while serving.
    Transfering,
    /// Receiving data; another replica answers reads.
    CatchingUp,
    Active,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Passive => "PASSIVE",
            Self::Transfering => "TRANSFERING",
            Self::CatchingUp => "CATCHING_UP",
            Self::Active => "ACTIVE",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apply {
    /// Not serving at all.
    Ignore,
    /// Left for another replica to answer.
    Defer,
    /// Answered without touching storage.
    Acknowledge,
    /// Delegated to storage.
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Nothing,
    /// The operation's durable effect is a storage write.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub apply: Apply,
    pub capture: Capture,
}

/// Side effects of initiating an operation, performed by the engine.
#[derive(Debug, Default)]
pub struct Effect {
    pub request: Option<StorageRequest>,
    pub response: Option<Response>,
    /// Position of a write handed to storage.
    pub captured: Option<Position>,
}

const IGNORE: Action = Action {
    apply: Apply::Ignore,
    capture: Capture::Nothing,
};
const DEFER: Action = Action {
    apply: Apply::Defer,
    capture: Capture::Nothing,
};
const READ: Action = Action {
    apply: Apply::Execute,
    capture: Capture::Nothing,
};
const WRITE: Action = Action {
    apply: Apply::Execute,
    capture: Capture::Write,
};

impl Action {
    /// `None` for combinations without behavior, which are answered as
    /// unsupported.
    pub fn lookup(state: ReplicaState, kind: OpKind) -> Option<Self> {
        use {OpKind::*, ReplicaState::*};
        match (state, kind) {
            (Passive, Get | Put | RangeQuery | MultiOp) => Some(IGNORE),
            (CatchingUp, Get | RangeQuery) => Some(DEFER),
            (CatchingUp, Put) => Some(Action {
                apply: Apply::Acknowledge,
                capture: Capture::Nothing,
            }),
            (CatchingUp, MultiOp) => None,
            (Active | Transfering, Get | RangeQuery) => Some(READ),
            (Active | Transfering, Put | MultiOp) => Some(WRITE),
        }
    }

    pub fn initiate(&self, op: &Operation, position: Position, version: VersionId) -> Effect {
        match self.apply {
            Apply::Ignore => {
                debug!("ignore {op:?} at {position}");
                Effect::default()
            }
            Apply::Defer => Effect::default(),
            Apply::Acknowledge => Effect {
                response: acknowledgement(op),
                ..Default::default()
            },
            Apply::Execute => Effect {
                request: Some(storage_request(op, version)),
                // writes are answered once issued, reads by storage
                response: acknowledgement(op),
                captured: (self.capture == Capture::Write).then_some(position),
            },
        }
    }

    /// The storage write reproducing `op` for a snapshot, if any.
    pub fn prepare_snapshot(&self, op: &Operation, version: VersionId) -> Option<StorageRequest> {
        match self.capture {
            Capture::Write => Some(storage_request(op, version)),
            Capture::Nothing => None,
        }
    }
}

fn acknowledgement(op: &Operation) -> Option<Response> {
    match &op.body {
        Body::Put { key, .. } => Some(Response {
            id: op.id,
            outcome: Outcome::Put { key: key.clone() },
        }),
        _ => None,
    }
}

fn storage_request(op: &Operation, version: VersionId) -> StorageRequest {
    match &op.body {
        Body::Get { key } => StorageRequest::Get {
            id: op.id,
            key: key.clone(),
        },
        Body::Put { key, data } => StorageRequest::Put {
            key: key.clone(),
            data: data.clone(),
            version,
        },
        Body::RangeQuery {
            range,
            limit,
            filter,
            action,
        } => StorageRequest::RangeScan(RangeReq {
            limit: *limit,
            filter: filter.clone(),
            action: action.clone(),
            action_version: version,
            ..RangeReq::read(op.id, range.clone())
        }),
        Body::MultiOp {
            conditions,
            success_puts,
            failure_puts,
        } => StorageRequest::MultiOp {
            id: op.id,
            conditions: conditions.clone(),
            success_puts: success_puts.clone(),
            failure_puts: failure_puts.clone(),
            version,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyRange;

    const STATES: [ReplicaState; 4] = [
        ReplicaState::Passive,
        ReplicaState::Transfering,
        ReplicaState::CatchingUp,
        ReplicaState::Active,
    ];

    fn ops() -> [Operation; 4] {
        [
            Operation::get("a"),
            Operation::put("a", "1"),
            Operation::range_query(KeyRange::full()),
            Operation::new(Body::MultiOp {
                conditions: Vec::new(),
                success_puts: Default::default(),
                failure_puts: Default::default(),
            }),
        ]
    }

    #[test]
    fn coverage() {
        for state in STATES {
            for op in ops() {
                let action = Action::lookup(state, op.kind());
                let registered = !matches!(
                    (state, op.kind()),
                    (ReplicaState::CatchingUp, OpKind::MultiOp)
                );
                assert_eq!(action.is_some(), registered, "{state} {op:?}");
            }
        }
    }

    #[test]
    fn active_put_writes_and_acknowledges() {
        let op = Operation::put([0x10u8], "a");
        let effect = Action::lookup(ReplicaState::Active, OpKind::Put)
            .unwrap()
            .initiate(&op, 5, 3);
        assert!(matches!(
            effect.request,
            Some(StorageRequest::Put { version: 3, .. })
        ));
        assert_eq!(effect.response.unwrap().id, op.id);
        assert_eq!(effect.captured, Some(5));
    }

    #[test]
    fn active_get_goes_to_storage_only() {
        let op = Operation::get("a");
        let effect = Action::lookup(ReplicaState::Transfering, OpKind::Get)
            .unwrap()
            .initiate(&op, 5, 3);
        assert!(matches!(effect.request, Some(StorageRequest::Get { .. })));
        assert!(effect.response.is_none());
        assert!(effect.captured.is_none());
    }

    #[test]
    fn catching_up() {
        let [get, put, range, _] = ops();
        for op in [get, range] {
            let effect = Action::lookup(ReplicaState::CatchingUp, op.kind())
                .unwrap()
                .initiate(&op, 1, 1);
            assert!(effect.request.is_none() && effect.response.is_none());
        }
        let effect = Action::lookup(ReplicaState::CatchingUp, OpKind::Put)
            .unwrap()
            .initiate(&put, 1, 1);
        assert!(effect.request.is_none());
        assert!(effect.captured.is_none());
        assert_eq!(
            effect.response.unwrap().outcome,
            Outcome::Put { key: "a".into() }
        );
    }

    #[test]
    fn passive_ignores_everything() {
        for op in ops() {
            let effect = Action::lookup(ReplicaState::Passive, op.kind())
                .unwrap()
                .initiate(&op, 1, 1);
            assert!(effect.request.is_none() && effect.response.is_none());
        }
    }

    #[test]
    fn snapshot_captures_writes_only() {
        for op in ops() {
            let action = Action::lookup(ReplicaState::Active, op.kind()).unwrap();
            let captured = action.prepare_snapshot(&op, 2).is_some();
            assert_eq!(
                captured,
                matches!(op.kind(), OpKind::Put | OpKind::MultiOp),
                "{op:?}"
            );
        }
    }
}
