use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    engine::Event,
    model::{EventSender, Message, Transport},
    transfer::TransferMessage,
    Addr,
};

/// Inboxes of the replicas running in this process.
#[derive(Debug, Default)]
pub struct ChannelNet {
    inboxes: DashMap<Addr, EventSender<Event>>,
}

impl ChannelNet {
    pub fn register(&self, addr: Addr, inbox: EventSender<Event>) {
        self.inboxes.insert(addr, inbox);
    }

    pub fn unregister(&self, addr: &Addr) {
        self.inboxes.remove(addr);
    }
}

#[derive(Debug, Clone)]
pub struct ChannelTransport {
    addr: Addr,
    net: Arc<ChannelNet>,
}

impl ChannelTransport {
    pub fn new(addr: Addr, net: Arc<ChannelNet>) -> Self {
        Self { addr, net }
    }
}

#[async_trait::async_trait]
impl Transport<TransferMessage> for ChannelTransport {
    fn addr(&self) -> Addr {
        self.addr.clone()
    }

    async fn send_to(&self, destination: Addr, message: TransferMessage) -> crate::Result<()>
    where
        TransferMessage: Message,
    {
        let Some(inbox) = self.net.inboxes.get(&destination).map(|inbox| inbox.clone()) else {
            crate::bail!("unknown destination {destination}")
        };
        // same bytes as on a wire
        let message = bincode::deserialize::<TransferMessage>(&bincode::serialize(&message)?)?;
        inbox.send(Event::Transfer(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::event_channel, transfer::TransferId};

    #[tokio::test]
    async fn delivers_to_registered_inbox() {
        let net = Arc::new(ChannelNet::default());
        let (inbox, mut source) = event_channel();
        let to = Addr::Untyped("to".into());
        net.register(to.clone(), inbox);
        let transport = ChannelTransport::new(Addr::Untyped("from".into()), net.clone());
        let message = TransferMessage::ClearToSend {
            id: TransferId(1),
            quota: 3,
        };
        transport.send_to(to.clone(), message).await.unwrap();
        assert!(matches!(
            source.next().await.unwrap(),
            Event::Transfer(TransferMessage::ClearToSend { quota: 3, .. })
        ));

        net.unregister(&to);
        let message = TransferMessage::ClearToSend {
            id: TransferId(1),
            quota: 3,
        };
        assert!(transport.send_to(to, message).await.is_err());
    }
}
