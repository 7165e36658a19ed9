use once_cell::sync::Lazy;
use secrecy::Secret;
use uuid::Uuid;

use rendezvous::application::Application;
use rendezvous::settings::{ApplicationSettings, Settings};

static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug")
    }
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
});

pub struct TestApp {
    pub address: String,
    pub port: u16,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_key(None).await
    }

    pub async fn spawn_with_key(api_key: Option<&str>) -> Self {
        Lazy::force(&TRACING);
        let settings = Settings {
            application: ApplicationSettings {
                host: "127.0.0.1".to_string(),
                port: 0,
                api_key: api_key.map(|key| Secret::new(key.to_string())),
            },
        };
        let app = Application::build(settings)
            .await
            .expect("Failed to build application");
        let port = app.port();
        let _ = tokio::spawn(app.run_until_stopped());
        Self {
            address: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}/{path}", self.address, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/session", self.address, self.port)
    }

    pub fn ws_url_with_id(&self, id: Uuid) -> String {
        format!("{}?id={id}", self.ws_url())
    }
}
