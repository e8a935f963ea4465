use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    key::{Key, KeyRange},
    store::range::{Limit, RangeAction, TransformationFilter},
};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl OpId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpId({:016x})", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub key: Key,
    /// `None` requires the key to be absent.
    pub expected: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OpId,
    pub body: Body,
}

#[derive(Debug, Clone)]
pub enum Body {
    Get {
        key: Key,
    },
    Put {
        key: Key,
        data: Vec<u8>,
    },
    RangeQuery {
        range: KeyRange,
        limit: Limit,
        filter: Option<Arc<dyn TransformationFilter>>,
        action: Option<Arc<dyn RangeAction>>,
    },
    MultiOp {
        conditions: Vec<Condition>,
        success_puts: BTreeMap<Key, Vec<u8>>,
        failure_puts: BTreeMap<Key, Vec<u8>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Put,
    RangeQuery,
    MultiOp,
}

/// Whether executing one operation first changes the result of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Affected,
    Unaffected,
    /// No relation is defined for this pair yet.
    Undetermined,
}

impl Conflict {
    /// Undetermined pairs are treated as conflicting.
    pub fn may_conflict(self) -> bool {
        !matches!(self, Self::Unaffected)
    }
}

impl Operation {
    pub fn new(body: Body) -> Self {
        Self {
            id: OpId::random(),
            body,
        }
    }

    pub fn get(key: impl Into<Key>) -> Self {
        Self::new(Body::Get { key: key.into() })
    }

    pub fn put(key: impl Into<Key>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(Body::Put {
            key: key.into(),
            data: data.into(),
        })
    }

    pub fn range_query(range: KeyRange) -> Self {
        Self::new(Body::RangeQuery {
            range,
            limit: Limit::Unlimited,
            filter: None,
            action: None,
        })
    }

    pub fn kind(&self) -> OpKind {
        match self.body {
            Body::Get { .. } => OpKind::Get,
            Body::Put { .. } => OpKind::Put,
            Body::RangeQuery { .. } => OpKind::RangeQuery,
            Body::MultiOp { .. } => OpKind::MultiOp,
        }
    }

    /// Would executing `prior` before this operation change this operation's
    /// result?
    ///
    /// Every new operation kind must extend this for all existing kinds.
    pub fn affected_by(&self, prior: &Operation) -> Conflict {
        use Body::*;
        match (&self.body, &prior.body) {
            (Get { key }, Put { key: written, .. }) => {
                if key == written {
                    Conflict::Affected
                } else {
                    Conflict::Unaffected
                }
            }
            (Get { .. }, Get { .. }) => Conflict::Unaffected,
            (Get { .. }, RangeQuery { .. } | MultiOp { .. }) => Conflict::Undetermined,
            (Put { .. }, _) => Conflict::Unaffected,
            (RangeQuery { .. } | MultiOp { .. }, _) => Conflict::Undetermined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    UnsupportedOp,
    Failure,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: OpId,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Get {
        key: Key,
        value: Option<Vec<u8>>,
    },
    Put {
        key: Key,
    },
    Range {
        results: BTreeMap<Key, Vec<u8>>,
        more: bool,
    },
    MultiOp {
        success: bool,
    },
    Failed(ResponseCode),
}

impl Response {
    pub fn failed(id: OpId, code: ResponseCode) -> Self {
        Self {
            id,
            outcome: Outcome::Failed(code),
        }
    }
}
