//! Running replicas in one process.

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use tokio::{sync::watch, time::timeout};
use tracing::{debug, info};

use crate::{
    config::Config,
    engine::{Engine, EngineContext, Event, Upcall, ViewChange},
    key::{KeyRange, Position},
    log::{Decide, LogCommand, LogHandle},
    model::{event_channel, promise_channel, EventSender, EventSource, PromiseSender},
    net::{ChannelNet, ChannelTransport},
    op::{OpId, Operation, Response, ResponseCode},
    store::{storage_loop, MemoryStore},
    task::BackgroundSpawner,
    view::View,
    Addr,
};

pub type Subscription = (Addr, EventSender<Event>);

/// Total order over every proposal of the group.
///
/// Positions start at 1. A subscriber receives the decisions made after it
/// subscribed, in batches of whatever was proposed meanwhile.
pub async fn sequencer_loop(
    mut commands: EventSource<LogCommand>,
    mut subscriptions: EventSource<Subscription>,
) -> crate::Result<()> {
    let mut position = 0;
    let mut subscribers = BTreeMap::new();
    let mut watermarks = BTreeMap::<Addr, Position>::new();
    let mut subscribing = true;
    loop {
        let command = tokio::select! {
            biased;
            subscription = subscriptions.option_next(), if subscribing => {
                match subscription {
                    Some((addr, sender)) => {
                        debug!("sequencer: subscribe {addr}");
                        subscribers.insert(addr, sender);
                    }
                    None => subscribing = false,
                }
                continue;
            }
            command = commands.option_next() => match command {
                Some(command) => command,
                None => return Ok(()),
            },
        };
        let mut batch = Vec::new();
        let mut next = Some(command);
        while let Some(command) = next {
            match command {
                LogCommand::Propose(value) => {
                    position += 1;
                    batch.push(Decide { position, value })
                }
                LogCommand::Prune { replica, watermark } => {
                    watermarks.insert(replica, watermark);
                    debug!(
                        "sequencer: prunable up to {:?}",
                        watermarks.values().min()
                    )
                }
            }
            next = commands.try_next()
        }
        if batch.is_empty() {
            continue;
        }
        // joined before anything in the batch was proposed
        while let Some((addr, sender)) = subscriptions.try_next() {
            debug!("sequencer: subscribe {addr}");
            subscribers.insert(addr, sender);
        }
        subscribers.retain(|addr, sender: &mut EventSender<Event>| {
            let delivered = sender.send(Event::Decide(batch.clone())).is_ok();
            if !delivered {
                debug!("sequencer: {addr} is gone")
            }
            delivered
        })
    }
}

/// Submits operations to one replica and matches its responses.
#[derive(Debug, Clone)]
pub struct Client {
    events: EventSender<Event>,
    pending: Arc<DashMap<OpId, PromiseSender<Response>>>,
    config: Config,
}

impl Client {
    pub async fn invoke(&self, op: Operation) -> crate::Result<Response> {
        let id = op.id;
        let (sender, source) = promise_channel();
        self.pending.insert(id, sender);
        self.events.send(Event::Op(op))?;
        match timeout(self.config.op_timeout(), source).await {
            Ok(response) => Ok(response?),
            Err(_) => {
                self.pending.remove(&id);
                Ok(Response::failed(id, ResponseCode::Timeout))
            }
        }
    }

    // the first response wins, replicas answering the same operation again
    // are ignored
    fn deliver(&self, response: Response) {
        match self.pending.remove(&response.id) {
            Some((_, sender)) => {
                if sender.resolve(response).is_err() {
                    debug!("response after client gave up")
                }
            }
            None => debug!("duplicated response of {}", response.id),
        }
    }
}

async fn upcall_loop(
    addr: Addr,
    client: Client,
    synced: watch::Sender<bool>,
    mut upcalls: EventSource<Upcall>,
) -> crate::Result<()> {
    while let Some(upcall) = upcalls.option_next().await {
        match upcall {
            Upcall::Response(response) => client.deliver(response),
            Upcall::Synced => {
                info!("{addr}: synced");
                synced.send_replace(true);
            }
            Upcall::Size { range, bytes, keys } => {
                info!("{addr}: {range:?} holds {keys} keys in {bytes} bytes")
            }
            Upcall::Diff(diff) => debug!("{addr}: size changed by {diff:?}"),
        }
    }
    Ok(())
}

pub struct Replica {
    pub addr: Addr,
    pub client: Client,
    events: EventSender<Event>,
    synced: watch::Receiver<bool>,
}

impl Replica {
    pub async fn wait_synced(&mut self) -> crate::Result<()> {
        self.synced.wait_for(|synced| *synced).await?;
        Ok(())
    }

    pub fn send(&self, event: impl Into<Event>) -> crate::Result<()> {
        self.events.send(event.into())
    }

    pub fn stop(&self) -> crate::Result<()> {
        self.events.send(Event::Stop)
    }
}

/// A replica group sharing one sequencer and one in-process network.
pub struct Cluster {
    config: Config,
    spawner: BackgroundSpawner,
    net: Arc<ChannelNet>,
    log: EventSender<LogCommand>,
    subscriptions: EventSender<Subscription>,
    leader: Option<EventSender<Event>>,
    view: View,
    range: KeyRange,
}

impl Cluster {
    pub fn new(config: Config, range: KeyRange, spawner: BackgroundSpawner) -> Self {
        let (log, commands) = event_channel();
        let (subscriptions, subscription_source) = event_channel();
        spawner.spawn(sequencer_loop(commands, subscription_source));
        Self {
            config,
            spawner,
            net: Default::default(),
            log,
            subscriptions,
            leader: None,
            view: View::new(0, []),
            range,
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    /// Starts a replica and grows the group by it. The first replica serves
    /// the range right away, later ones join through a view change led by the
    /// first.
    pub fn add_replica(&mut self, addr: Addr) -> crate::Result<Replica> {
        let (events, source) = event_channel();
        let (upcall, upcalls) = event_channel();
        let (store, store_source) = event_channel();
        self.spawner
            .spawn(storage_loop(MemoryStore::default(), store_source));
        self.net.register(addr.clone(), events.clone());
        self.subscriptions.send((addr.clone(), events.clone()))?;

        let mut engine = Engine::new(EngineContext {
            addr: addr.clone(),
            log: LogHandle {
                replica: addr.clone(),
                sender: self.log.clone(),
            },
            store,
            transport: ChannelTransport::new(addr.clone(), self.net.clone()),
            upcall,
            events: events.clone(),
            spawner: self.spawner.clone(),
            config: self.config.clone(),
        });
        let view = View::new(
            self.view.id + 1,
            self.view.members.iter().cloned().chain([addr.clone()]),
        );
        let quorum = view.members.len() / 2 + 1;
        match &self.leader {
            None => {
                engine.bootstrap(view.clone(), quorum, self.range.clone())?;
                self.leader = Some(events.clone())
            }
            Some(leader) => leader.send(
                ViewChange {
                    view: view.clone(),
                    quorum,
                    range: self.range.clone(),
                }
                .into(),
            )?,
        }
        info!("replica {addr} joins view {}", view.id);
        self.view = view;
        self.spawner.spawn(engine.run(source));

        let client = Client {
            events: events.clone(),
            pending: Default::default(),
            config: self.config.clone(),
        };
        let (synced_sender, synced) = watch::channel(false);
        self.spawner
            .spawn(upcall_loop(addr.clone(), client.clone(), synced_sender, upcalls));
        Ok(Replica {
            addr,
            client,
            events,
            synced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Value;

    #[tokio::test]
    async fn sequencer_orders_and_broadcasts() {
        let (log, commands) = event_channel();
        let (subscriptions, subscription_source) = event_channel();
        let sequencer = tokio::spawn(sequencer_loop(commands, subscription_source));
        let (a, mut a_source) = event_channel();
        let (b, mut b_source) = event_channel();
        subscriptions
            .send((Addr::Untyped("a".into()), a))
            .unwrap();
        subscriptions
            .send((Addr::Untyped("b".into()), b))
            .unwrap();
        for _ in 0..3 {
            log.send(LogCommand::Propose(Value::Noop { id: OpId::random() }))
                .unwrap()
        }

        for source in [&mut a_source, &mut b_source] {
            let mut positions = Vec::new();
            while positions.len() < 3 {
                let Event::Decide(batch) = source.next().await.unwrap() else {
                    panic!()
                };
                positions.extend(batch.iter().map(|decide| decide.position))
            }
            assert_eq!(positions, [1, 2, 3]);
        }
        drop(log);
        sequencer.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn client_times_out() {
        let (events, _source) = event_channel();
        let client = Client {
            events,
            pending: Default::default(),
            config: Config {
                op_timeout_ms: 10,
                ..Default::default()
            },
        };
        let op = Operation::get("k");
        let id = op.id;
        let response = client.invoke(op).await.unwrap();
        assert_eq!(response, Response::failed(id, ResponseCode::Timeout));
        assert!(client.pending.is_empty());
    }
}
