use std::sync::Arc;

use log::{error, info, warn};
use rocket::fairing::AdHoc;
use thiserror::Error;

use crate::classifier::{BertClassifier, Prediction, TextClassifier};
use crate::config::ServiceConfig;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model is not loaded or available.")]
    InvalidState,
    #[error("Inference failed: {source}")]
    InferenceFailure {
        #[source]
        source: anyhow::Error,
    },
}

/// The process-wide sentiment model.
///
/// Loading is attempted exactly once, in the constructor. If it fails the
/// pipeline stays unset for the life of the process and every call to
/// [`SentimentModel::predict`] returns [`ModelError::InvalidState`].
pub struct SentimentModel {
    model_id: String,
    pipeline: Option<Box<dyn TextClassifier>>,
}

impl SentimentModel {
    /// Builds the model with a custom pipeline loader.
    pub fn with_loader<F>(model_id: &str, loader: F) -> Self
    where
        F: FnOnce(&str) -> anyhow::Result<Box<dyn TextClassifier>>,
    {
        Self {
            model_id: model_id.to_string(),
            pipeline: Self::load(model_id, loader),
        }
    }

    fn load<F>(model_id: &str, loader: F) -> Option<Box<dyn TextClassifier>>
    where
        F: FnOnce(&str) -> anyhow::Result<Box<dyn TextClassifier>>,
    {
        info!("Loading model: {}", model_id);
        match loader(model_id) {
            Ok(pipeline) => {
                info!("Model loaded successfully.");
                Some(pipeline)
            }
            Err(e) => {
                error!("Failed to load model: {:#}", e);
                None
            }
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn predict(&self, text: &str) -> Result<Vec<Prediction>, ModelError> {
        let pipeline = self.pipeline.as_ref().ok_or(ModelError::InvalidState)?;

        pipeline.classify(text).map_err(|source| {
            error!("Error during inference: {:#}", source);
            ModelError::InferenceFailure { source }
        })
    }
}

fn load_bert(model_id: &str, revision: &str) -> anyhow::Result<Box<dyn TextClassifier>> {
    let classifier = BertClassifier::load(model_id, revision)?;
    Ok(Box::new(classifier))
}

/// Loads the model named by the service config once Rocket has ignited and
/// puts it into managed state.
pub fn stage() -> AdHoc {
    stage_with(load_bert)
}

/// [`stage`] with a custom loader, called with `(model_id, model_revision)`.
pub fn stage_with<F>(loader: F) -> AdHoc
where
    F: FnOnce(&str, &str) -> anyhow::Result<Box<dyn TextClassifier>> + Send + 'static,
{
    AdHoc::try_on_ignite("Sentiment model", |rocket| async move {
        let config = match ServiceConfig::from_figment(rocket.figment()) {
            Ok(config) => config,
            Err(e) => {
                error!("invalid service configuration: {}", e);
                return Err(rocket);
            }
        };

        let build = move || {
            SentimentModel::with_loader(&config.model_id, |id| loader(id, &config.model_revision))
        };
        match tokio::task::spawn_blocking(build).await {
            Ok(model) => {
                if !model.is_loaded() {
                    warn!("{} is unavailable; requests will get 503 until restart", model.model_id());
                }
                Ok(rocket.manage(Arc::new(model)))
            }
            Err(e) => {
                error!("model loader task failed: {}", e);
                Err(rocket)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use rocket::figment::providers::Serialized;
    use rocket::http::Status;
    use rocket::local::blocking::Client;

    use crate::api;

    struct Fixed;

    impl TextClassifier for Fixed {
        fn classify(&self, _text: &str) -> anyhow::Result<Vec<Prediction>> {
            Ok(vec![Prediction {
                label: "positive".to_string(),
                score: 0.9,
            }])
        }
    }

    struct Broken;

    impl TextClassifier for Broken {
        fn classify(&self, _text: &str) -> anyhow::Result<Vec<Prediction>> {
            Err(anyhow!("tensor shape mismatch"))
        }
    }

    #[test]
    fn failed_load_leaves_pipeline_unset() {
        let model = SentimentModel::with_loader("missing/model", |_| Err(anyhow!("404")));
        assert!(!model.is_loaded());
        assert_eq!(model.model_id(), "missing/model");
        assert!(matches!(model.predict("hi"), Err(ModelError::InvalidState)));
    }

    #[test]
    fn loader_receives_model_id() {
        let model = SentimentModel::with_loader("org/model", |id| {
            assert_eq!(id, "org/model");
            Ok(Box::new(Fixed) as Box<dyn TextClassifier>)
        });
        assert!(model.is_loaded());
        let result = model.predict("I love this!").unwrap();
        assert_eq!(result[0].label, "positive");
    }

    #[test]
    fn pipeline_errors_become_inference_failures() {
        let model = SentimentModel::with_loader("org/model", |_| Ok(Box::new(Broken) as Box<dyn TextClassifier>));
        let err = model.predict("anything").unwrap_err();
        assert_eq!(err.to_string(), "Inference failed: tensor shape mismatch");
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("tensor shape mismatch"));
    }

    #[test]
    fn invalid_config_aborts_ignition() {
        let figment = rocket::Config::figment().merge(Serialized::default("model_id", ["a", "b"]));
        let rocket = api::mount(rocket::custom(figment).attach(stage_with(|_, _| {
            Ok(Box::new(Fixed) as Box<dyn TextClassifier>)
        })));
        assert!(Client::tracked(rocket).is_err());
    }

    #[test]
    fn failed_load_still_ignites_and_reports_unavailable() {
        let rocket = api::mount(rocket::build().attach(stage_with(|_, _| Err(anyhow!("offline")))));
        let client = Client::tracked(rocket).expect("ignites without a model");
        assert_eq!(client.get("/").dispatch().status(), Status::ServiceUnavailable);

        let managed = client.rocket().state::<Arc<SentimentModel>>().expect("model is managed");
        assert!(!managed.is_loaded());
    }

    #[test]
    fn stage_loads_configured_model() {
        let figment = rocket::Config::figment()
            .merge(Serialized::default("model_id", "org/sst2"))
            .merge(Serialized::default("model_revision", "v2"));
        let rocket = api::mount(rocket::custom(figment).attach(stage_with(|id, revision| {
            assert_eq!((id, revision), ("org/sst2", "v2"));
            Ok(Box::new(Fixed) as Box<dyn TextClassifier>)
        })));
        let client = Client::tracked(rocket).expect("ignites");
        assert_eq!(client.get("/").dispatch().status(), Status::Ok);

        let managed = client.rocket().state::<Arc<SentimentModel>>().expect("model is managed");
        assert_eq!(managed.model_id(), "org/sst2");
    }
}
