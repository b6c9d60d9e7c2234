//! Prompt pool and prompt resolution
//!
//! The pool is a JSON document mapping a model family to canonical prompts
//! keyed by input length:
//!
//! ```json
//! { "opt": { "32": "...", "1024": "...", "8192": "..." } }
//! ```
//!
//! It is read once at startup and never modified.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::PromptRequest;
use crate::error::{BenchError, Result};

/// Largest canonical input length stored in the pool
pub const CANONICAL_MAX_LENGTH: usize = 8192;

/// Largest input length that may be requested from the pool
///
/// Longer requests are synthesized by repetition, so this caps the
/// synthesized prompt at 128 copies of the canonical entry.
pub const MAX_INPUT_TOKENS: usize = 128 * CANONICAL_MAX_LENGTH;

/// Canonical prompts per model family and input-length key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptPool {
    families: BTreeMap<String, BTreeMap<String, String>>,
}

impl PromptPool {
    /// Parse a pool from JSON text
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::FormatError`] if the text is not a family -> key -> prompt map.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BenchError::FormatError {
            reason: format!("invalid prompt pool: {e}"),
        })
    }

    /// Load a pool from a JSON file
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::IoError`] if the file cannot be read and
    /// [`BenchError::FormatError`] if it cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| BenchError::IoError {
            message: format!("failed to read prompt pool {}: {e}", path.display()),
        })?;
        Self::from_json(&json)
    }

    /// Family names present in the pool
    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }

    /// Canonical prompt for a family and length key
    #[must_use]
    pub fn get(&self, family: &str, key: &str) -> Option<&str> {
        self.families
            .get(family)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }

    /// Pick the pool family for a model
    ///
    /// An explicit family must exist in the pool. Otherwise the longest family
    /// name contained in the lower-cased model identifier wins.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::ConfigError`] if no family matches.
    pub fn family_for<'a>(&'a self, model_id: &str, explicit: Option<&str>) -> Result<&'a str> {
        if let Some(name) = explicit {
            return self
                .families
                .get_key_value(name)
                .map(|(k, _)| k.as_str())
                .ok_or_else(|| {
                    BenchError::ConfigError(format!(
                        "model family '{name}' not found in prompt pool"
                    ))
                });
        }

        let id = model_id.to_lowercase();
        self.families()
            .filter(|family| id.contains(&family.to_lowercase()))
            .max_by_key(|family| family.len())
            .ok_or_else(|| {
                BenchError::ConfigError(format!(
                    "no prompt pool family matches model '{model_id}'; use --model-family or --prompt"
                ))
            })
    }

    /// Resolve the canonical prompt for a requested input length
    ///
    /// Lengths above [`CANONICAL_MAX_LENGTH`] repeat the largest canonical entry
    /// `length / 8192` times, which approximates the requested token count.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::ConfigError`] if the needed entry is absent or
    /// `length` exceeds [`MAX_INPUT_TOKENS`].
    pub fn resolve(&self, family: &str, key: &str, length: usize) -> Result<String> {
        if length > MAX_INPUT_TOKENS {
            return Err(BenchError::ConfigError(format!(
                "{length} input tokens exceeds the supported maximum of {MAX_INPUT_TOKENS}"
            )));
        }
        if length > CANONICAL_MAX_LENGTH {
            let base = self
                .get(family, &CANONICAL_MAX_LENGTH.to_string())
                .ok_or_else(|| {
                    BenchError::ConfigError(format!(
                        "prompt pool family '{family}' has no {CANONICAL_MAX_LENGTH}-token entry to extend"
                    ))
                })?;
            return Ok(base.repeat(length / CANONICAL_MAX_LENGTH));
        }

        self.get(family, key).map(str::to_string).ok_or_else(|| {
            BenchError::ConfigError(format!(
                "no canonical prompt for {key} input tokens; use --prompt for custom input"
            ))
        })
    }
}

/// Resolve the literal prompt text for a run
///
/// An explicit prompt is returned verbatim and the pool is not consulted.
///
/// # Errors
///
/// Returns [`BenchError::ConfigError`] if a pool lookup is needed and fails.
pub fn resolve_prompt(
    request: &PromptRequest,
    pool: &PromptPool,
    model_id: &str,
    family: Option<&str>,
) -> Result<String> {
    match request {
        PromptRequest::Explicit(text) => Ok(text.clone()),
        PromptRequest::Pool { key, length } => {
            let family = pool.family_for(model_id, family)?;
            pool.resolve(family, key, *length)
        },
    }
}

/// Repeat the prompt across the batch dimension
#[must_use]
pub fn replicate_batch(prompt: &str, batch_size: usize) -> Vec<String> {
    vec![prompt.to_string(); batch_size]
}
