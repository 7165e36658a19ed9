use secrecy::Secret;

pub struct Settings {
    pub application: ApplicationSettings,
}

#[derive(serde::Deserialize, Clone)]
pub struct ApplicationSettings {
    pub port: u16,
    pub host: String,
    /// Shared key participants present on the websocket upgrade. `None`
    /// leaves the relay open.
    #[serde(default)]
    pub api_key: Option<Secret<String>>,
}
