//! Model classes, launch recipes and per-recipe option bags.
//!
//! A recipe selects which backend binary serves a model and which launch
//! options apply to it.  Options merge in layers (request over model
//! descriptor over server config over recipe defaults) with "first non-empty
//! wins" semantics, expressed as a left-fold of [`RecipeOptions::inherit`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ServeError;

/// The model classes the pool partitions by.  A model belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelClass {
    Llm,
    Embedding,
    Reranking,
    Audio,
}

impl ModelClass {
    pub const ALL: [ModelClass; 4] = [
        ModelClass::Llm,
        ModelClass::Embedding,
        ModelClass::Reranking,
        ModelClass::Audio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Llm => "llm",
            ModelClass::Embedding => "embedding",
            ModelClass::Reranking => "reranking",
            ModelClass::Audio => "audio",
        }
    }
}

impl fmt::Display for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm" => Ok(ModelClass::Llm),
            "embedding" => Ok(ModelClass::Embedding),
            "reranking" => Ok(ModelClass::Reranking),
            "audio" => Ok(ModelClass::Audio),
            other => Err(format!("unknown model class '{other}'")),
        }
    }
}

/// Launch strategy: which backend binary to spawn and how to talk to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipe {
    #[serde(rename = "llamacpp")]
    LlamaCpp,
    #[serde(rename = "oga-cpu")]
    OgaCpu,
    #[serde(rename = "oga-hybrid")]
    OgaHybrid,
    #[serde(rename = "oga-npu")]
    OgaNpu,
    #[serde(rename = "ryzenai")]
    RyzenAi,
    #[serde(rename = "flm")]
    Flm,
    #[serde(rename = "whispercpp")]
    WhisperCpp,
}

impl Recipe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recipe::LlamaCpp => "llamacpp",
            Recipe::OgaCpu => "oga-cpu",
            Recipe::OgaHybrid => "oga-hybrid",
            Recipe::OgaNpu => "oga-npu",
            Recipe::RyzenAi => "ryzenai",
            Recipe::Flm => "flm",
            Recipe::WhisperCpp => "whispercpp",
        }
    }

    /// The closed option key set recognized by this recipe.
    pub fn option_keys(&self) -> &'static [&'static str] {
        match self {
            Recipe::LlamaCpp => &["ctx_size", "llamacpp_backend", "llamacpp_args"],
            Recipe::OgaCpu | Recipe::OgaHybrid | Recipe::OgaNpu | Recipe::RyzenAi | Recipe::Flm => {
                &["ctx_size"]
            }
            Recipe::WhisperCpp => &[],
        }
    }

    /// Recipe-independent defaults, consulted when no layer set a key.
    pub fn default_option(key: &str) -> Option<OptionValue> {
        match key {
            "ctx_size" => Some(OptionValue::Int(4096)),
            "llamacpp_backend" => Some(OptionValue::Text("vulkan".to_string())),
            "llamacpp_args" => Some(OptionValue::Text(String::new())),
            _ => None,
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Recipe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llamacpp" => Ok(Recipe::LlamaCpp),
            "oga-cpu" => Ok(Recipe::OgaCpu),
            "oga-hybrid" => Ok(Recipe::OgaHybrid),
            "oga-npu" => Ok(Recipe::OgaNpu),
            "ryzenai" => Ok(Recipe::RyzenAi),
            "flm" => Ok(Recipe::Flm),
            "whispercpp" => Ok(Recipe::WhisperCpp),
            other => Err(format!("unknown recipe '{other}'")),
        }
    }
}

/// A scalar option value.  `-1` and `""` are empty sentinels: they mean
/// "unset" and never override a lower-priority layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Int(i64),
    Text(String),
}

impl OptionValue {
    pub fn is_empty(&self) -> bool {
        match self {
            OptionValue::Int(v) => *v == -1,
            OptionValue::Text(s) => s.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(v) => Some(*v),
            OptionValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            OptionValue::Int(_) => None,
        }
    }
}

/// A raw key/value option bag, as stored on descriptors and in requests.
pub type RawOptions = BTreeMap<String, OptionValue>;

/// Typed option bag scoped to one recipe's key set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeOptions {
    recipe: Recipe,
    options: BTreeMap<String, OptionValue>,
}

impl RecipeOptions {
    /// Filter `raw` down to the keys `recipe` recognizes, dropping empty
    /// sentinels.  Unknown keys are ignored, matching the layered-merge
    /// contract (they are not an error until someone asks for them).
    pub fn new(recipe: Recipe, raw: &RawOptions) -> Self {
        let mut options = BTreeMap::new();
        for key in recipe.option_keys() {
            if let Some(value) = raw.get(*key) {
                if !value.is_empty() {
                    options.insert((*key).to_string(), value.clone());
                }
            }
        }
        Self { recipe, options }
    }

    pub fn empty(recipe: Recipe) -> Self {
        Self {
            recipe,
            options: BTreeMap::new(),
        }
    }

    /// Extract an option bag from a JSON object, coercing numbers and
    /// strings.  Non-scalar and unrecognized-type values are skipped.
    pub fn from_json(recipe: Recipe, value: &serde_json::Value) -> Self {
        let mut raw = RawOptions::new();
        if let Some(map) = value.as_object() {
            for (key, v) in map {
                let parsed = match v {
                    serde_json::Value::Number(n) => n.as_i64().map(OptionValue::Int),
                    serde_json::Value::String(s) => Some(OptionValue::Text(s.clone())),
                    _ => None,
                };
                if let Some(parsed) = parsed {
                    raw.insert(key.clone(), parsed);
                }
            }
        }
        Self::new(recipe, &raw)
    }

    pub fn recipe(&self) -> Recipe {
        self.recipe
    }

    /// Merge a lower-priority layer under `self`: every key already set here
    /// wins; every non-empty key on `lower` that is missing here is copied.
    pub fn inherit(&self, lower: &RecipeOptions) -> RecipeOptions {
        let mut merged = self.options.clone();
        for (key, value) in &lower.options {
            if !merged.contains_key(key) && !value.is_empty() {
                merged.insert(key.clone(), value.clone());
            }
        }
        RecipeOptions {
            recipe: self.recipe,
            options: merged,
        }
    }

    /// Stored value or the recipe default.  Keys outside the recipe's set
    /// fail with `UnknownOption`.
    pub fn get(&self, key: &str) -> Result<OptionValue, ServeError> {
        if !self.recipe.option_keys().contains(&key) {
            return Err(ServeError::UnknownOption {
                key: key.to_string(),
                recipe: self.recipe,
            });
        }
        if let Some(value) = self.options.get(key) {
            return Ok(value.clone());
        }
        Recipe::default_option(key).ok_or_else(|| ServeError::Internal(format!(
            "option '{key}' has no default"
        )))
    }

    pub fn get_int(&self, key: &str) -> Result<i64, ServeError> {
        self.get(key)?.as_int().ok_or_else(|| {
            ServeError::Internal(format!("option '{key}' is not an integer"))
        })
    }

    pub fn get_text(&self, key: &str) -> Result<String, ServeError> {
        match self.get(key)? {
            OptionValue::Text(s) => Ok(s),
            OptionValue::Int(_) => Err(ServeError::Internal(format!(
                "option '{key}' is not a string"
            ))),
        }
    }

    pub fn to_raw(&self) -> RawOptions {
        self.options.clone()
    }

    pub fn to_log_string(&self) -> String {
        serde_json::to_string(&self.options).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, OptionValue)]) -> RawOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn new_filters_to_recipe_key_set() {
        let bag = raw(&[
            ("ctx_size", OptionValue::Int(2048)),
            ("llamacpp_backend", OptionValue::Text("cpu".into())),
            ("unrelated", OptionValue::Int(7)),
        ]);
        let opts = RecipeOptions::new(Recipe::Flm, &bag);
        assert_eq!(opts.get_int("ctx_size").unwrap(), 2048);
        assert!(matches!(
            opts.get("llamacpp_backend"),
            Err(ServeError::UnknownOption { .. })
        ));
    }

    #[test]
    fn new_drops_empty_sentinels() {
        let bag = raw(&[
            ("ctx_size", OptionValue::Int(-1)),
            ("llamacpp_backend", OptionValue::Text(String::new())),
        ]);
        let opts = RecipeOptions::new(Recipe::LlamaCpp, &bag);
        // Both fall through to the defaults.
        assert_eq!(opts.get_int("ctx_size").unwrap(), 4096);
        assert_eq!(opts.get_text("llamacpp_backend").unwrap(), "vulkan");
    }

    #[test]
    fn inherit_keeps_higher_priority_values() {
        let high = RecipeOptions::new(
            Recipe::LlamaCpp,
            &raw(&[("ctx_size", OptionValue::Int(1024))]),
        );
        let low = RecipeOptions::new(
            Recipe::LlamaCpp,
            &raw(&[
                ("ctx_size", OptionValue::Int(8192)),
                ("llamacpp_backend", OptionValue::Text("cpu".into())),
            ]),
        );
        let merged = high.inherit(&low);
        assert_eq!(merged.get_int("ctx_size").unwrap(), 1024);
        assert_eq!(merged.get_text("llamacpp_backend").unwrap(), "cpu");
    }

    #[test]
    fn whispercpp_has_no_options() {
        let opts = RecipeOptions::new(
            Recipe::WhisperCpp,
            &raw(&[("ctx_size", OptionValue::Int(2048))]),
        );
        assert!(matches!(
            opts.get("ctx_size"),
            Err(ServeError::UnknownOption { .. })
        ));
    }
}
