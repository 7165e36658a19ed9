use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web_actors::ws;
use presence_mesh::message::{Envelope, SignalMessage};
use tracing::{debug, error, info};
use uuid::Uuid;

pub use ws::start;

use super::switchboard::{self, Switchboard};

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct WsSession {
    id: Uuid,
    heartbeat: Instant,
    switchboard: Addr<Switchboard>,
}

impl WsSession {
    pub fn new(id: Uuid, switchboard: Addr<Switchboard>) -> Self {
        Self {
            id,
            heartbeat: Instant::now(),
            switchboard,
        }
    }

    fn heartbeat(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.heartbeat) > CLIENT_TIMEOUT {
                error!("Participant {} stopped answering pings, disconnecting", act.id);
                ctx.stop();
                return;
            }

            ctx.ping(b"");
        });
    }
}

impl Handler<switchboard::Deliver> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: switchboard::Deliver, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(serde_json::to_string(&msg.0).unwrap());
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    /// Registers with the switchboard; on success the assigned id is the
    /// first message on the socket. A taken id ends the session before any
    /// message is sent.
    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);

        let addr = ctx.address();
        info!("Session for participant {} starting", self.id);
        self.switchboard
            .send(switchboard::Connect {
                id: self.id,
                addr: addr.recipient(),
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                match res {
                    Ok(Ok(())) => {
                        ctx.text(serde_json::to_string(&SignalMessage::Id(act.id)).unwrap());
                    }
                    Ok(Err(switchboard::Error::AlreadyConnected)) => {
                        error!("Participant id {} already in session. Stopping.", act.id);
                        ctx.stop();
                    }
                    Err(e) => {
                        error!(?e);
                        ctx.stop();
                    }
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        self.switchboard
            .do_send(switchboard::Disconnect { id: self.id });
        Running::Stop
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => self.switchboard.do_send(switchboard::Forward {
                    to: envelope.to,
                    content: envelope.content,
                }),
                Err(e) => debug!("Ignoring malformed envelope from {}: {e}", self.id),
            },
            Ok(ws::Message::Binary(_)) => debug!("Ignoring binary frame from {}", self.id),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(_) => ctx.stop(),
        }
    }
}
