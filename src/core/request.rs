//! Turns the draft, route, and stored settings into a transport-ready
//! parameter object. Pure: key resolution is a read, and a builder
//! failure means no request is issued and the session never leaves
//! idle.

use std::error::Error as StdError;
use std::fmt;

use crate::api::StreamRequest;
use crate::auth::{KeyBag, Provider, Route};
use crate::core::config::Config;

/// Runtime sampling overrides. Anything set here wins over the profile
/// defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingOverrides {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub json_mode: Option<bool>,
}

pub struct BuildInputs<'a> {
    pub draft: &'a str,
    pub route: &'a Route,
    pub config: &'a Config,
    pub keys: &'a KeyBag,
    pub overrides: &'a SamplingOverrides,
    /// Caller-supplied system prompt, joined ahead of the profile one.
    pub system_prompt_override: Option<&'a str>,
}

/// Failures reported synchronously to the caller, before any network
/// attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    EmptyPrompt,
    MissingKey(Provider),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::EmptyPrompt => write!(f, "Nothing to send: the message is empty"),
            BuildError::MissingKey(provider) => write!(
                f,
                "No API key configured for {}. Add one to send requests to this provider.",
                provider.display_name()
            ),
        }
    }
}

impl StdError for BuildError {}

/// Build the transport parameters for one generation.
///
/// The prompt is trimmed and nothing else; token-level mutation is not
/// this layer's business. Remote providers without a resolvable key
/// fail fast with [`BuildError::MissingKey`] unless the bag's bypass
/// flag is set.
pub fn build_request(inputs: BuildInputs<'_>) -> Result<StreamRequest, BuildError> {
    let prompt = inputs.draft.trim();
    if prompt.is_empty() {
        return Err(BuildError::EmptyPrompt);
    }

    let provider = inputs.route.provider;
    let api_key = inputs.keys.resolve(provider);
    if api_key.is_none() && provider.requires_api_key() && !inputs.keys.allow_missing_key {
        return Err(BuildError::MissingKey(provider));
    }

    let system_prompt = join_system_prompts(
        inputs.system_prompt_override,
        inputs.config.system_prompt.as_deref(),
    );

    let sampling = &inputs.config.sampling;
    Ok(StreamRequest {
        provider,
        model: inputs.route.model.clone(),
        base_url: provider.default_base_url().to_string(),
        prompt: prompt.to_string(),
        system_prompt,
        temperature: inputs.overrides.temperature.or(sampling.temperature),
        top_p: inputs.overrides.top_p.or(sampling.top_p),
        max_tokens: inputs.overrides.max_tokens.or(sampling.max_tokens),
        json_mode: inputs
            .overrides
            .json_mode
            .or(sampling.json_mode)
            .unwrap_or(false),
        api_key,
    })
}

/// Override first, profile second, joined by a blank line. Blank parts
/// are dropped entirely.
fn join_system_prompts(override_prompt: Option<&str>, profile_prompt: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [override_prompt, profile_prompt]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}
