use serde::{Deserialize, Serialize};

/// Broker connection settings, the `[mqtt]` table of the config file.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Global topic prefix; modules without an explicit `base` live under `<base>/<name>`
    pub base: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            base: "home/room/pc".to_string(),
            client_id: "mqttbridge".to_string(),
            keep_alive_secs: 5,
        }
    }
}

impl MqttConfig {
    /// Default topic namespace for a module that declares no `base`
    pub fn module_base(&self, module_name: &str) -> String {
        format!("{}/{}", self.base.trim_end_matches('/'), module_name)
    }

    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty()
    }
}
