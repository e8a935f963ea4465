//! Execution engine of one replica.
//!
//! The engine owns the replica's view, range, version id and snapshot
//! watermark, and only changes them while applying decided values in
//! position order. Storage, transfers and the replicated log are reached
//! through channels. Their replies come back as events, so the engine never
//! waits on any of them.

use std::{collections::HashMap, future::Future, mem::replace};

use derive_more::From;
use tracing::{debug, info, warn};

use crate::{
    action::{Action, ReplicaState},
    config::Config,
    key::{KeyRange, Position, VersionId},
    log::{Decide, OperationsLog, Reconfigure, ReplicatedLog, Value},
    model::{event_channel, promise_channel, EventSender, EventSource, Transport},
    op::{OpId, Operation, Outcome, Response, ResponseCode},
    store::{SizeDelta, StorageRequest, StorageResponse, StoreHandle},
    task::BackgroundSpawner,
    transfer::{
        receive_data, send_data, transfer_lifecycle, Completed, InitiateTransfer, Metadata,
        Outbound, Role, Stopped, TransferHandle, TransferId, TransferMessage,
    },
    view::View,
    Addr,
};

/// Leader's request to move the group to a new view.
#[derive(Debug, Clone)]
pub struct ViewChange {
    pub view: View,
    pub quorum: usize,
    pub range: KeyRange,
}

#[derive(Debug, Clone)]
pub struct ReplicationSetInfo {
    pub range: KeyRange,
}

#[derive(Debug, From)]
pub enum Event {
    /// Client submission.
    Op(Operation),
    /// A batch of decisions in delivery order.
    Decide(Vec<Decide>),
    ViewChange(ViewChange),
    ReplicationSetInfo(ReplicationSetInfo),
    Storage(StorageResponse),
    Transfer(TransferMessage),
    TransferCompleted(Completed),
    TransferStopped(Stopped),
    #[from(ignore)]
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upcall {
    Response(Response),
    /// Serving the whole range.
    Synced,
    Size {
        range: KeyRange,
        bytes: u64,
        keys: u64,
    },
    Diff(SizeDelta),
}

/// Everything an engine talks to.
pub struct EngineContext<L, T> {
    pub addr: Addr,
    pub log: L,
    pub store: StoreHandle,
    pub transport: T,
    pub upcall: EventSender<Upcall>,
    pub events: EventSender<Event>,
    pub spawner: BackgroundSpawner,
    pub config: Config,
}

// a catch-up waiting for its sync marker to be decided
#[derive(Debug)]
struct Syncing {
    marker: OpId,
    snapshot: Position,
    version: VersionId,
}

fn next_version(version: VersionId) -> crate::Result<VersionId> {
    version
        .checked_add(1)
        .ok_or_else(|| crate::err!("version id {version} exhausted"))
}

pub struct Engine<L, T> {
    context: EngineContext<L, T>,
    state: ReplicaState,
    view: View,
    quorum: usize,
    range: KeyRange,
    version: VersionId,
    last_snapshot: Position,
    pruned: Position,
    log: OperationsLog,
    outgoing: HashMap<TransferId, TransferHandle>,
    incoming: Option<TransferHandle>,
    held: Option<InitiateTransfer>,
    syncing: Option<Syncing>,
}

impl<L: ReplicatedLog, T: Transport<TransferMessage>> Engine<L, T> {
    pub fn new(context: EngineContext<L, T>) -> Self {
        Self {
            context,
            state: ReplicaState::Passive,
            view: View::new(0, []),
            quorum: 0,
            range: KeyRange::full(),
            version: 0,
            last_snapshot: 0,
            pruned: 0,
            log: Default::default(),
            outgoing: Default::default(),
            incoming: None,
            held: None,
            syncing: None,
        }
    }

    /// Starts serving `range` as the only source of truth, e.g., the first
    /// replica of a group.
    pub fn bootstrap(&mut self, view: View, quorum: usize, range: KeyRange) -> crate::Result<()> {
        info!("{}: bootstrap view {} for {range:?}", self.context.addr, view.id);
        self.view = view;
        self.quorum = quorum;
        self.range = range;
        self.version = 1;
        self.state = ReplicaState::Active;
        self.context.upcall.send(Upcall::Synced)
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    pub fn last_snapshot(&self) -> Position {
        self.last_snapshot
    }

    pub fn handle(&mut self, event: Event) -> crate::Result<()> {
        match event {
            Event::Op(op) => self.submit(op),
            Event::Decide(decisions) => {
                for decide in decisions {
                    for (position, value) in self.log.insert(decide.position, decide.value) {
                        self.apply(position, value)?
                    }
                }
                self.prune()
            }
            Event::ViewChange(change) => self.propose_view(change),
            Event::ReplicationSetInfo(info) => self.context.log.propose(Value::scan(info.range)),
            Event::Storage(response) => self.on_storage(response),
            Event::Transfer(message) => self.route(message),
            Event::TransferCompleted(completed) => self.on_transfer_completed(completed),
            Event::TransferStopped(Stopped(id)) => {
                self.on_transfer_stopped(id);
                Ok(())
            }
            Event::Stop => {
                self.shutdown();
                Ok(())
            }
        }
    }

    fn submit(&mut self, op: Operation) -> crate::Result<()> {
        if self.state == ReplicaState::Passive {
            debug!("{}: ignore {op:?} before joining", self.context.addr);
            return Ok(());
        }
        if Action::lookup(self.state, op.kind()).is_none() {
            return self.respond(Response::failed(op.id, ResponseCode::UnsupportedOp));
        }
        self.context.log.propose(Value::Op(op))
    }

    fn propose_view(&mut self, change: ViewChange) -> crate::Result<()> {
        if !change.view.is_newer_than(&self.view) {
            debug!(
                "{}: view change to {} not newer than {}",
                self.context.addr, change.view.id, self.view.id
            );
            return Ok(());
        }
        self.context.log.propose(Value::Reconfigure(Reconfigure {
            id: OpId::random(),
            view: change.view,
            quorum: change.quorum,
            version: self.version,
            range: change.range,
        }))
    }

    fn apply(&mut self, position: Position, value: Value) -> crate::Result<()> {
        match value {
            Value::Op(op) => self.apply_op(position, op),
            Value::Reconfigure(reconfigure) => self.reconfigure(position, reconfigure),
            Value::Scan { range, .. } => self.issue(StorageRequest::SizeScan { range }),
            Value::SyncedUp { id } => self.synced_up(position, id),
            Value::Noop { .. } => Ok(()),
            Value::Unknown { id, tag } => {
                warn!("{}: unknown value (tag {tag}, {id}) at {position}", self.context.addr);
                Ok(())
            }
        }
    }

    fn apply_op(&mut self, position: Position, op: Operation) -> crate::Result<()> {
        let Some(action) = Action::lookup(self.state, op.kind()) else {
            debug!("{}: {:?} unsupported in {}", self.context.addr, op.kind(), self.state);
            return self.respond(Response::failed(op.id, ResponseCode::UnsupportedOp));
        };
        let effect = action.initiate(&op, position, self.version);
        if let Some(request) = effect.request {
            self.issue(request)?
        }
        if let Some(response) = effect.response {
            self.respond(response)?
        }
        if let Some(position) = effect.captured {
            self.last_snapshot = position
        }
        Ok(())
    }

    fn reconfigure(&mut self, position: Position, reconfigure: Reconfigure) -> crate::Result<()> {
        if !reconfigure.view.is_newer_than(&self.view) {
            debug!(
                "{}: stale reconfiguration to view {} at {position}",
                self.context.addr, reconfigure.view.id
            );
            return Ok(());
        }
        let old = replace(&mut self.view, reconfigure.view);
        self.quorum = reconfigure.quorum;
        self.range = reconfigure.range;
        info!(
            "{}: view {} -> {} in {} at {position}",
            self.context.addr, old.id, self.view.id, self.state
        );
        match self.state {
            ReplicaState::Passive => {
                self.version = next_version(reconfigure.version)?;
                self.state = ReplicaState::CatchingUp;
                self.start_receive()
            }
            ReplicaState::CatchingUp => {
                self.version = self.version.max(next_version(reconfigure.version)?);
                Ok(())
            }
            ReplicaState::Active | ReplicaState::Transfering => {
                self.version = next_version(self.version)?;
                self.state = ReplicaState::Transfering;
                let recipients = old.recipients(&self.view, &self.context.addr);
                for recipient in recipients {
                    self.start_send(recipient, position)
                }
                self.finish_transfering();
                Ok(())
            }
        }
    }

    fn synced_up(&mut self, position: Position, marker: OpId) -> crate::Result<()> {
        let Syncing {
            snapshot, version, ..
        } = match self.syncing.take() {
            Some(syncing) if syncing.marker == marker => syncing,
            syncing => {
                self.syncing = syncing;
                debug!("{}: sync marker {marker} of another replica", self.context.addr);
                return Ok(());
            }
        };
        // the sender's version, unless a later view already moved past it
        self.version = self.version.max(version);
        let requests = self
            .log
            .snapshot_diff(snapshot)
            .take_while(|(diff_position, _)| *diff_position < position)
            .filter_map(|(_, op)| {
                Action::lookup(ReplicaState::Active, op.kind())?.prepare_snapshot(op, self.version)
            })
            .collect::<Vec<_>>();
        info!(
            "{}: synced up at {position}, replay {} writes after {snapshot}",
            self.context.addr,
            requests.len()
        );
        self.issue(StorageRequest::Snapshot { position, requests })?;
        self.last_snapshot = snapshot;
        self.issue(StorageRequest::Cleanup {
            range: self.range.clone(),
            version,
        })?;
        self.state = ReplicaState::Active;
        self.context.upcall.send(Upcall::Synced)
    }

    fn on_storage(&mut self, response: StorageResponse) -> crate::Result<()> {
        if let Some(diff) = response.diff() {
            self.context.upcall.send(Upcall::Diff(diff))?
        }
        match response {
            StorageResponse::Get { id, key, value } => self.respond(Response {
                id,
                outcome: Outcome::Get { key, value },
            }),
            StorageResponse::Range(resp) => self.respond(Response {
                id: resp.id,
                outcome: Outcome::Range {
                    results: resp.results,
                    more: resp.more,
                },
            }),
            StorageResponse::MultiOp { id, success } => self.respond(Response {
                id,
                outcome: Outcome::MultiOp { success },
            }),
            StorageResponse::Size { range, bytes, keys } => {
                self.context.upcall.send(Upcall::Size { range, bytes, keys })
            }
            StorageResponse::Snapshot { position } => {
                self.last_snapshot = self.last_snapshot.max(position);
                self.prune()
            }
            StorageResponse::Failed { id } => {
                self.respond(Response::failed(id, ResponseCode::Failure))
            }
            StorageResponse::Done => Ok(()),
        }
    }

    fn respond(&self, response: Response) -> crate::Result<()> {
        self.context.upcall.send(Upcall::Response(response))
    }

    /// Sends `request` to storage now, so storage sees requests in issue
    /// order, and routes the response back as an event.
    fn issue(&self, request: StorageRequest) -> crate::Result<()> {
        if matches!(
            request,
            StorageRequest::Put { .. } | StorageRequest::Cleanup { .. }
        ) {
            return self.context.store.send((request, None));
        }
        let (sender, source) = promise_channel();
        self.context.store.send((request, Some(sender)))?;
        let events = self.context.events.clone();
        self.context.spawner.spawn(async move {
            if let Ok(response) = source.await {
                if events.send(Event::Storage(response)).is_err() {
                    debug!("storage response after engine stopped")
                }
            }
            Ok(())
        });
        Ok(())
    }

    fn prune(&mut self) -> crate::Result<()> {
        if self.last_snapshot <= self.pruned {
            return Ok(());
        }
        self.pruned = self.last_snapshot;
        self.log.prune(self.pruned);
        self.context.log.prune(self.pruned)
    }

    fn start_transfer(
        &self,
        id: TransferId,
        role: Role,
        sender: EventSender<TransferMessage>,
        run: impl Future<Output = crate::Result<Metadata>> + Send + 'static,
    ) -> TransferHandle {
        let stop = self.context.spawner.token().child_token();
        let (completed, completion) = promise_channel();
        self.context.spawner.spawn(transfer_lifecycle(
            id,
            role,
            run,
            completed,
            stop.clone(),
            self.context.events.clone(),
        ));
        let events = self.context.events.clone();
        self.context.spawner.spawn(async move {
            if let Ok(completed) = completion.await {
                if events.send(Event::TransferCompleted(completed)).is_err() {
                    debug!("transfer completed after engine stopped")
                }
            }
            Ok(())
        });
        TransferHandle::new(id, role, sender, stop)
    }

    fn start_send(&mut self, recipient: Addr, position: Position) {
        let id = TransferId::random();
        let (sender, source) = event_channel();
        info!(
            "{}: transfer {id} of {:?} to {recipient}",
            self.context.addr, self.range
        );
        let outbound = Outbound {
            id,
            recipient,
            range: self.range.clone(),
            metadata: Metadata {
                snapshot_id: Some(position),
                version_id: Some(self.version),
            },
        };
        let run = send_data(
            outbound,
            self.context.store.clone(),
            self.context.transport.clone(),
            source,
            self.context.config.clone(),
        );
        let handle = self.start_transfer(id, Role::Send, sender, run);
        self.outgoing.insert(id, handle);
    }

    fn start_receive(&mut self) -> crate::Result<()> {
        let id = TransferId::random();
        let (sender, source) = event_channel();
        let run = receive_data(
            self.context.store.clone(),
            self.context.transport.clone(),
            source,
            self.context.config.clone(),
        );
        let handle = self.start_transfer(id, Role::Receive, sender, run);
        if let Some(initiate) = self.held.take() {
            handle.deliver(TransferMessage::Initiate(initiate))?
        }
        self.incoming = Some(handle);
        Ok(())
    }

    fn route(&mut self, message: TransferMessage) -> crate::Result<()> {
        match message {
            TransferMessage::ClearToSend { id, .. } => match self.outgoing.get(&id) {
                Some(handle) => handle.deliver(message),
                None => {
                    debug!("{}: clear-to-send for unknown transfer {id}", self.context.addr);
                    Ok(())
                }
            },
            TransferMessage::Initiate(initiate) if self.state == ReplicaState::Passive => {
                debug!(
                    "{}: hold transfer {} until joining",
                    self.context.addr, initiate.id
                );
                self.held = Some(initiate);
                Ok(())
            }
            message => match &self.incoming {
                Some(handle) => handle.deliver(message),
                None => {
                    debug!(
                        "{}: no receive for transfer {}",
                        self.context.addr,
                        message.id()
                    );
                    Ok(())
                }
            },
        }
    }

    fn on_transfer_completed(&mut self, completed: Completed) -> crate::Result<()> {
        let Completed { id, role, outcome } = completed;
        match role {
            Role::Send => {
                match outcome {
                    Ok(_) => info!("{}: transfer {id} sent", self.context.addr),
                    Err(err) => warn!("{}: transfer {id} failed: {err:#}", self.context.addr),
                }
                if let Some(handle) = self.outgoing.get(&id) {
                    handle.stop()
                }
                Ok(())
            }
            Role::Receive => {
                match self.incoming.as_ref().filter(|handle| handle.id == id) {
                    Some(handle) => handle.stop(),
                    None => {
                        debug!("{}: completion of unknown receive {id}", self.context.addr);
                        return Ok(());
                    }
                }
                let metadata = match outcome {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        warn!("{}: receive {id} failed: {err:#}", self.context.addr);
                        return Ok(());
                    }
                };
                let (Some(snapshot), Some(version)) = (metadata.snapshot_id, metadata.version_id)
                else {
                    crate::bail!("transfer {id} completed without snapshot and version ids: {metadata:?}")
                };
                if self.state != ReplicaState::CatchingUp {
                    warn!("{}: receive {id} completed in {}", self.context.addr, self.state);
                    return Ok(());
                }
                let marker = Value::synced_up();
                self.syncing = Some(Syncing {
                    marker: marker.id(),
                    snapshot,
                    version,
                });
                self.context.log.propose(marker)
            }
        }
    }

    fn on_transfer_stopped(&mut self, id: TransferId) {
        if self.outgoing.remove(&id).is_some() {
            debug!("{}: transfer {id} destroyed", self.context.addr);
            self.finish_transfering()
        } else if self.incoming.as_ref().is_some_and(|handle| handle.id == id) {
            debug!("{}: receive {id} destroyed", self.context.addr);
            self.incoming = None
        }
    }

    fn finish_transfering(&mut self) {
        if self.state == ReplicaState::Transfering && self.outgoing.is_empty() {
            info!("{}: transfers done", self.context.addr);
            self.state = ReplicaState::Active
        }
    }

    fn shutdown(&mut self) {
        for handle in self.outgoing.values().chain(&self.incoming) {
            handle.stop()
        }
    }

    pub async fn run(mut self, mut source: EventSource<Event>) -> crate::Result<()> {
        while let Some(event) = source.option_next().await {
            if matches!(event, Event::Stop) {
                info!("{}: stop", self.context.addr);
                self.handle(event)?;
                break;
            }
            self.handle(event)?
        }
        Ok(())
    }
}
