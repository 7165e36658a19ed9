use actix::*;
use actix_web::http::header;
use actix_web::{dev::Server, get, web, App, HttpRequest, HttpResponse, HttpServer};
use secrecy::{ExposeSecret, Secret};
use std::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::settings::Settings;

use self::switchboard::Switchboard;

mod session;
mod switchboard;

pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(configuration: Settings) -> Result<Self, anyhow::Error> {
        let address = format!(
            "{}:{}",
            configuration.application.host, configuration.application.port
        );
        let listener = TcpListener::bind(&address)?;
        let port = listener.local_addr()?.port();
        info!("Running on port: {port}");

        let server = create_server(listener, configuration.application.api_key)?;
        Ok(Self { port, server })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

#[derive(Clone)]
struct Auth {
    // precomputed Authorization header value, None when the relay is open
    expected: Option<String>,
}

impl Auth {
    fn new(api_key: Option<Secret<String>>) -> Self {
        let expected = api_key.map(|key| {
            format!(
                "Basic {}",
                base64::encode(format!("participant:{}", key.expose_secret()))
            )
        });
        Self { expected }
    }

    fn allows(&self, req: &HttpRequest) -> bool {
        let Some(expected) = &self.expected else {
            return true;
        };
        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|presented| presented == expected)
    }
}

pub fn create_server(
    listener: TcpListener,
    api_key: Option<Secret<String>>,
) -> Result<Server, anyhow::Error> {
    let switchboard = web::Data::new(Switchboard::default().start());
    let auth = web::Data::new(Auth::new(api_key));
    Ok(HttpServer::new(move || {
        App::new()
            .app_data(switchboard.clone())
            .app_data(auth.clone())
            .service(health_check)
            .service(session)
    })
    .listen(listener)?
    .run())
}

#[get("/health_check")]
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().finish()
}

#[derive(Debug, serde::Deserialize)]
struct SessionQuery {
    /// Previously assigned id a reconnecting participant wants back.
    id: Option<Uuid>,
}

#[get("/session")]
async fn session(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<SessionQuery>,
    switchboard: web::Data<Addr<Switchboard>>,
    auth: web::Data<Auth>,
) -> Result<HttpResponse, actix_web::Error> {
    if !auth.allows(&req) {
        return Ok(HttpResponse::Unauthorized().finish());
    }
    let id = query.id.unwrap_or_else(Uuid::new_v4);
    let websocket = session::WsSession::new(id, switchboard.get_ref().clone());
    session::start(websocket, &req, stream)
}
