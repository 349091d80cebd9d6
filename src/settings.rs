use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RetrievalPolicies {
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSettings {
    pub default_model: Option<String>,
    pub model_params: Option<ModelParams>,
    pub retrieval: Option<RetrievalPolicies>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSettingsPatch {
    pub default_model: Option<String>,
    pub model_params: Option<ModelParams>,
    pub retrieval: Option<RetrievalPolicies>,
}

impl SessionSettings {
    pub fn apply_patch(&mut self, patch: SessionSettingsPatch) {
        if patch.default_model.is_some() { self.default_model = patch.default_model; }
        if patch.model_params.is_some() { self.model_params = patch.model_params; }
        if patch.retrieval.is_some() { self.retrieval = patch.retrieval; }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalConfigDefaults {
    pub default_model: String,
    pub temperature: f32,
    pub top_k: usize,
}

impl From<&AppConfig> for GlobalConfigDefaults {
    fn from(cfg: &AppConfig) -> Self {
        Self { default_model: cfg.chat_model.clone(), temperature: cfg.temperature, top_k: cfg.retrieval_k }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestOverrides {
    pub model: Option<String>,
    pub model_params: Option<ModelParams>,
    pub retrieval: Option<RetrievalPolicies>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveSettings {
    pub model: String,
    pub temperature: f32,
    pub top_k: usize,
}

pub fn resolve_effective_settings(
    global: &GlobalConfigDefaults,
    session: &SessionSettings,
    request: &RequestOverrides,
) -> EffectiveSettings {
    let model = request
        .model
        .clone()
        .or_else(|| session.default_model.clone())
        .unwrap_or_else(|| global.default_model.clone());

    let temperature = request
        .model_params
        .as_ref()
        .and_then(|p| p.temperature)
        .or_else(|| session.model_params.as_ref().and_then(|p| p.temperature))
        .unwrap_or(global.temperature);

    let top_k = request
        .retrieval
        .as_ref()
        .and_then(|p| p.top_k)
        .or_else(|| session.retrieval.as_ref().and_then(|p| p.top_k))
        .unwrap_or(global.top_k)
        .max(1);

    EffectiveSettings { model, temperature, top_k }
}
