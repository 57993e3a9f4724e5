use rocket::figment::Figment;
use serde::Deserialize;

pub const DEFAULT_MODEL_ID: &str = "Akirami/twitter-roberta-sentiment-analysiss-lr-1e-5";
pub const DEFAULT_REVISION: &str = "main";

/// Service settings read from Rocket's figment (`Rocket.toml`, `ROCKET_*`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_revision")]
    pub model_revision: String,
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

fn default_revision() -> String {
    DEFAULT_REVISION.to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            model_revision: default_revision(),
        }
    }
}

impl ServiceConfig {
    pub fn from_figment(figment: &Figment) -> Result<Self, rocket::figment::Error> {
        figment.extract()
    }
}
