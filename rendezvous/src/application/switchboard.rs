use std::collections::HashMap;

use actix::prelude::*;
use presence_mesh::message::SignalMessage;
use tracing::{debug, info};
use uuid::Uuid;

/// A signal on its way out to one participant's websocket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Deliver(pub SignalMessage);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Participant id already in session")]
    AlreadyConnected,
}

#[derive(Message)]
#[rtype(result = "Result<(), Error>")]
pub struct Connect {
    pub id: Uuid,
    pub addr: Recipient<Deliver>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub id: Uuid,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Forward {
    pub to: Uuid,
    pub content: SignalMessage,
}

/// Routes negotiation signals between connected participants. The relay
/// never inspects signal contents; participants that do not exist are a
/// silent drop, like any other unreachable peer.
#[derive(Default)]
pub struct Switchboard {
    participants: HashMap<Uuid, Recipient<Deliver>>,
}

impl Actor for Switchboard {
    type Context = Context<Self>;
}

impl Handler<Connect> for Switchboard {
    type Result = Result<(), Error>;

    fn handle(&mut self, msg: Connect, _ctx: &mut Self::Context) -> Self::Result {
        if self.participants.contains_key(&msg.id) {
            return Err(Error::AlreadyConnected);
        }
        info!("Participant {} joined", msg.id);
        self.participants.insert(msg.id, msg.addr);
        Ok(())
    }
}

impl Handler<Disconnect> for Switchboard {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _ctx: &mut Self::Context) -> Self::Result {
        if self.participants.remove(&msg.id).is_some() {
            info!("Participant {} left", msg.id);
        }
    }
}

impl Handler<Forward> for Switchboard {
    type Result = ();

    fn handle(&mut self, msg: Forward, _ctx: &mut Self::Context) -> Self::Result {
        match self.participants.get(&msg.to) {
            Some(addr) => addr.do_send(Deliver(msg.content)),
            None => debug!("Dropping signal for unknown participant {}", msg.to),
        }
    }
}
