use std::fmt;

use derive_more::From;
use serde::{Deserialize, Serialize};

#[derive(Debug, From)]
pub struct EventSource<M>(tokio::sync::mpsc::UnboundedReceiver<M>);

impl<M> EventSource<M> {
    pub async fn next(&mut self) -> crate::Result<M> {
        self.0
            .recv()
            .await
            .ok_or(crate::err!("unexpected source closing"))
    }

    pub async fn option_next(&mut self) -> Option<M> {
        self.0.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_next(&mut self) -> Option<M> {
        self.0.try_recv().ok()
    }
}

#[derive(Debug, From)]
pub struct EventSender<M>(tokio::sync::mpsc::UnboundedSender<M>);

impl<M> Clone for EventSender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M> EventSender<M> {
    pub fn send(&self, message: M) -> crate::Result<()> {
        self.0
            .send(message)
            .map_err(|_| crate::err!("unexpected event channel closing"))
    }
}

/// A thin wrapper around Tokio's unbounded MPSC channel.
///
/// Wrapped to integrate with `crate::Result`.
pub fn event_channel<M>() -> (EventSender<M>, EventSource<M>) {
    let channel = tokio::sync::mpsc::unbounded_channel();
    (EventSender(channel.0), EventSource(channel.1))
}

#[derive(Debug, From)]
pub struct PromiseSender<T>(tokio::sync::oneshot::Sender<T>);

pub type PromiseSource<T> = tokio::sync::oneshot::Receiver<T>;

pub fn promise_channel<T>() -> (PromiseSender<T>, PromiseSource<T>) {
    let chan = tokio::sync::oneshot::channel();
    (PromiseSender(chan.0), chan.1)
}

impl<T> PromiseSender<T> {
    pub fn resolve(self, value: T) -> crate::Result<()> {
        self.0
            .send(value)
            .map_err(|_| crate::err!("unexpected return channel closing"))
    }
}

pub trait Message
where
    Self: Clone + Send + Sync + 'static,
{
}

impl<M> Message for M where M: Clone + Send + Sync + 'static {}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Addr {
    Socket(std::net::SocketAddr),
    Untyped(String),
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{addr}"),
            Self::Untyped(name) => write!(f, "{name}"),
        }
    }
}

#[async_trait::async_trait]
pub trait Transport<M>
where
    Self: Clone + Send + Sync + 'static,
{
    fn addr(&self) -> Addr;

    async fn send_to(&self, destination: Addr, message: M) -> crate::Result<()>
    where
        M: Message;
}
