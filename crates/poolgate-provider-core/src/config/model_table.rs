use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

use crate::config::{ProviderConfig, ProviderKind};

/// Which overlay applies on top of the merged parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Chat,
    Stream,
    HealthCheck,
}

#[derive(Debug, Clone)]
pub struct ParamRule {
    pub name: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub clamp: bool,
}

/// Per-model parameter behavior: defaults, range rules, unsupported keys and
/// key renames (e.g. `stop` → `stop_sequences` for Anthropic models).
#[derive(Debug, Clone, Default)]
pub struct ModelParamSpec {
    pub defaults: JsonMap<String, JsonValue>,
    pub streaming_defaults: JsonMap<String, JsonValue>,
    pub health_defaults: JsonMap<String, JsonValue>,
    pub rules: Vec<ParamRule>,
    pub unsupported: Vec<String>,
    pub mappings: Vec<(String, String)>,
}

#[derive(Debug)]
enum ModelMatch {
    Exact(String),
    /// Original glob plus its compiled case-insensitive form.
    Pattern(String, Regex),
}

#[derive(Debug)]
struct RegistryEntry {
    kind: ProviderKind,
    matcher: ModelMatch,
    spec: ModelParamSpec,
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    provider_wide: HashMap<ProviderKind, JsonMap<String, JsonValue>>,
    entries: Vec<RegistryEntry>,
}

#[derive(Debug)]
pub struct MergedParams {
    pub params: JsonMap<String, JsonValue>,
    pub warnings: Vec<String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider_defaults(
        mut self,
        kind: ProviderKind,
        defaults: JsonMap<String, JsonValue>,
    ) -> Self {
        self.provider_wide.insert(kind, defaults);
        self
    }

    pub fn with_pattern(mut self, kind: ProviderKind, glob: &str, spec: ModelParamSpec) -> Self {
        let regex = glob_to_regex(glob);
        self.entries.push(RegistryEntry {
            kind,
            matcher: ModelMatch::Pattern(glob.to_string(), regex),
            spec,
        });
        self
    }

    pub fn with_exact(mut self, kind: ProviderKind, model: &str, spec: ModelParamSpec) -> Self {
        self.entries.push(RegistryEntry {
            kind,
            matcher: ModelMatch::Exact(model.to_string()),
            spec,
        });
        self
    }

    /// Registry shipped with the gateway. Covers the model families the
    /// bundled adapters know about; operators extend it via configuration.
    pub fn builtin() -> Self {
        let mut registry = Self::new().with_provider_defaults(
            ProviderKind::Alibaba,
            object(&[("result_format", JsonValue::String("message".to_string()))]),
        );

        registry = registry.with_pattern(
            ProviderKind::Alibaba,
            "qwen*",
            ModelParamSpec {
                streaming_defaults: object(&[("incremental_output", JsonValue::Bool(true))]),
                rules: vec![ParamRule {
                    name: "temperature".to_string(),
                    min: Some(0.1),
                    max: Some(2.0),
                    clamp: true,
                }],
                ..Default::default()
            },
        );

        for kind in [ProviderKind::Anthropic, ProviderKind::Bedrock] {
            registry = registry.with_pattern(
                kind,
                if kind == ProviderKind::Bedrock { "anthropic.*" } else { "claude*" },
                ModelParamSpec {
                    defaults: object(&[("max_tokens", JsonValue::Number(Number::from(4096)))]),
                    rules: vec![ParamRule {
                        name: "temperature".to_string(),
                        min: Some(0.0),
                        max: Some(1.0),
                        clamp: true,
                    }],
                    unsupported: vec![
                        "logit_bias".to_string(),
                        "seed".to_string(),
                        "presence_penalty".to_string(),
                        "frequency_penalty".to_string(),
                        "n".to_string(),
                        "user".to_string(),
                        "response_format".to_string(),
                        "logprobs".to_string(),
                        "top_logprobs".to_string(),
                        // Tool schemas are not translated to the messages shape.
                        "tools".to_string(),
                        "tool_choice".to_string(),
                    ],
                    mappings: vec![
                        ("stop".to_string(), "stop_sequences".to_string()),
                        (
                            "max_completion_tokens".to_string(),
                            "max_tokens".to_string(),
                        ),
                    ],
                    ..Default::default()
                },
            );
        }

        // Reasoning models reject sampling knobs and renamed their token cap.
        for family in ["o1*", "o3*"] {
            registry = registry.with_pattern(
                ProviderKind::OpenAI,
                family,
                ModelParamSpec {
                    unsupported: vec!["temperature".to_string(), "top_p".to_string()],
                    mappings: vec![(
                        "max_tokens".to_string(),
                        "max_completion_tokens".to_string(),
                    )],
                    ..Default::default()
                },
            );
        }

        registry
    }

    /// Compose the parameters an adapter sends upstream.
    ///
    /// Precedence (later wins): provider-wide defaults, pattern defaults,
    /// exact defaults, caller parameters, then the mode overlay
    /// (streaming/health, registry entries first, provider config last).
    /// Validation, unsupported-key deletion and renames run on the result.
    pub fn effective_params(
        &self,
        provider: &ProviderConfig,
        model: &str,
        caller: &JsonMap<String, JsonValue>,
        mode: MergeMode,
    ) -> MergedParams {
        let mut warnings = Vec::new();

        if !provider.use_model_defaults {
            let mut params = caller.clone();
            apply_mode_overlay(&mut params, provider, mode);
            return MergedParams { params, warnings };
        }

        let (pattern_hits, exact_hits) = self.matching_specs(provider.kind, model);

        let mut params = self
            .provider_wide
            .get(&provider.kind)
            .cloned()
            .unwrap_or_default();
        for spec in &pattern_hits {
            overlay(&mut params, &spec.defaults);
        }
        for spec in &exact_hits {
            overlay(&mut params, &spec.defaults);
        }
        overlay(&mut params, caller);

        match mode {
            MergeMode::Chat => {}
            MergeMode::Stream => {
                for spec in pattern_hits.iter().chain(exact_hits.iter()) {
                    overlay(&mut params, &spec.streaming_defaults);
                }
            }
            MergeMode::HealthCheck => {
                for spec in pattern_hits.iter().chain(exact_hits.iter()) {
                    overlay(&mut params, &spec.health_defaults);
                }
            }
        }
        apply_mode_overlay(&mut params, provider, mode);

        for spec in pattern_hits.iter().chain(exact_hits.iter()) {
            for rule in &spec.rules {
                apply_rule(&mut params, rule, model, &mut warnings);
            }
            for key in &spec.unsupported {
                if params.remove(key).is_some() {
                    warnings.push(format!("{model}: dropped unsupported parameter {key}"));
                }
            }
            for (from, to) in &spec.mappings {
                if let Some(value) = params.remove(from) {
                    params.insert(to.clone(), value);
                }
            }
        }

        MergedParams { params, warnings }
    }

    fn matching_specs(
        &self,
        kind: ProviderKind,
        model: &str,
    ) -> (Vec<&ModelParamSpec>, Vec<&ModelParamSpec>) {
        let mut patterns = Vec::new();
        let mut exacts = Vec::new();
        for entry in &self.entries {
            if entry.kind != kind {
                continue;
            }
            match &entry.matcher {
                ModelMatch::Exact(name) if name == model => exacts.push(&entry.spec),
                ModelMatch::Pattern(_, regex) if regex.is_match(model) => {
                    patterns.push(&entry.spec)
                }
                _ => {}
            }
        }
        (patterns, exacts)
    }
}

fn apply_mode_overlay(
    params: &mut JsonMap<String, JsonValue>,
    provider: &ProviderConfig,
    mode: MergeMode,
) {
    match mode {
        MergeMode::Chat => {}
        MergeMode::Stream => {
            if let Some(streaming) = &provider.streaming_params {
                overlay(params, streaming);
            }
        }
        MergeMode::HealthCheck => {
            if let Some(health) = &provider.health_check_params {
                overlay(params, health);
            }
        }
    }
}

fn overlay(target: &mut JsonMap<String, JsonValue>, source: &JsonMap<String, JsonValue>) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

fn apply_rule(
    params: &mut JsonMap<String, JsonValue>,
    rule: &ParamRule,
    model: &str,
    warnings: &mut Vec<String>,
) {
    let Some(value) = params.get(&rule.name).and_then(JsonValue::as_f64) else {
        return;
    };
    let below = rule.min.is_some_and(|min| value < min);
    let above = rule.max.is_some_and(|max| value > max);
    if !below && !above {
        return;
    }
    if rule.clamp {
        let clamped = if below {
            rule.min.unwrap_or(value)
        } else {
            rule.max.unwrap_or(value)
        };
        if let Some(number) = Number::from_f64(clamped) {
            params.insert(rule.name.clone(), JsonValue::Number(number));
        }
        warnings.push(format!(
            "{model}: clamped {} from {value} to {clamped}",
            rule.name
        ));
    } else {
        warnings.push(format!(
            "{model}: {} value {value} outside allowed range",
            rule.name
        ));
    }
}

/// Globs are matched case-insensitively; `*` spans segments, `?` one char.
fn glob_to_regex(glob: &str) -> Regex {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push_str("(?i)^");
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            ch => pattern.push_str(&regex::escape(&ch.to_string())),
        }
    }
    pattern.push('$');
    // The alphabet above cannot produce an invalid expression.
    Regex::new(&pattern).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

fn object(pairs: &[(&str, JsonValue)]) -> JsonMap<String, JsonValue> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialsRef;

    fn alibaba_provider() -> ProviderConfig {
        ProviderConfig {
            name: "dashscope".to_string(),
            kind: ProviderKind::Alibaba,
            credentials_ref: Some(CredentialsRef::Name("main".to_string())),
            api_key: None,
            api_base: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            model_name: "qwen2.5-72b-instruct".to_string(),
            priority: 5,
            weight: 1,
            timeout_ms: 60_000,
            max_retries: 2,
            retry_delay_ms: 500,
            headers: Default::default(),
            rate_limits: None,
            provider_params: Default::default(),
            health_check_params: None,
            streaming_params: None,
            cost_per_token: None,
            use_model_defaults: true,
        }
    }

    #[test]
    fn qwen_stream_merge_keeps_caller_values() {
        let registry = ModelRegistry::builtin();
        let caller = object(&[
            ("temperature", serde_json::json!(0.3)),
            ("enable_thinking", JsonValue::Bool(false)),
        ]);
        let merged = registry.effective_params(
            &alibaba_provider(),
            "qwen2.5-72b-instruct",
            &caller,
            MergeMode::Stream,
        );
        assert_eq!(merged.params["incremental_output"], true);
        assert_eq!(merged.params["temperature"], 0.3);
        assert_eq!(merged.params["enable_thinking"], false);
        assert_eq!(merged.params["result_format"], "message");
        assert!(merged.warnings.is_empty());
    }

    #[test]
    fn out_of_range_temperature_is_clamped_with_warning() {
        let registry = ModelRegistry::builtin();
        let caller = object(&[("temperature", serde_json::json!(5.0))]);
        let merged = registry.effective_params(
            &alibaba_provider(),
            "qwen2.5-72b-instruct",
            &caller,
            MergeMode::Chat,
        );
        assert_eq!(merged.params["temperature"], 2.0);
        assert_eq!(merged.warnings.len(), 1);
    }

    #[test]
    fn rule_without_clamp_warns_but_keeps_value() {
        let registry = ModelRegistry::new().with_pattern(
            ProviderKind::OpenAI,
            "gpt*",
            ModelParamSpec {
                rules: vec![ParamRule {
                    name: "top_p".to_string(),
                    min: Some(0.0),
                    max: Some(1.0),
                    clamp: false,
                }],
                ..Default::default()
            },
        );
        let mut provider = alibaba_provider();
        provider.kind = ProviderKind::OpenAI;
        let caller = object(&[("top_p", serde_json::json!(3.0))]);
        let merged = registry.effective_params(&provider, "gpt-4o", &caller, MergeMode::Chat);
        assert_eq!(merged.params["top_p"], 3.0);
        assert_eq!(merged.warnings.len(), 1);
    }

    #[test]
    fn anthropic_stop_is_renamed_and_unsupported_dropped() {
        let registry = ModelRegistry::builtin();
        let mut provider = alibaba_provider();
        provider.kind = ProviderKind::Anthropic;
        let caller = object(&[
            ("stop", serde_json::json!(["END"])),
            ("seed", serde_json::json!(42)),
        ]);
        let merged =
            registry.effective_params(&provider, "claude-sonnet-4", &caller, MergeMode::Chat);
        assert!(merged.params.get("stop").is_none());
        assert_eq!(merged.params["stop_sequences"], serde_json::json!(["END"]));
        assert!(merged.params.get("seed").is_none());
        assert_eq!(merged.params["max_tokens"], 4096);
    }

    #[test]
    fn use_model_defaults_false_skips_registry() {
        let registry = ModelRegistry::builtin();
        let mut provider = alibaba_provider();
        provider.use_model_defaults = false;
        let caller = object(&[("temperature", serde_json::json!(9.0))]);
        let merged = registry.effective_params(
            &provider,
            "qwen2.5-72b-instruct",
            &caller,
            MergeMode::Chat,
        );
        assert_eq!(merged.params["temperature"], 9.0);
        assert!(merged.params.get("result_format").is_none());
    }

    #[test]
    fn provider_streaming_params_overlay_last() {
        let registry = ModelRegistry::builtin();
        let mut provider = alibaba_provider();
        provider.streaming_params = Some(object(&[("incremental_output", JsonValue::Bool(false))]));
        let merged = registry.effective_params(
            &provider,
            "qwen2.5-72b-instruct",
            &JsonMap::new(),
            MergeMode::Stream,
        );
        assert_eq!(merged.params["incremental_output"], false);
    }

    #[test]
    fn glob_match_is_case_insensitive() {
        let regex = glob_to_regex("Qwen*");
        assert!(regex.is_match("qwen2.5-72b-instruct"));
        assert!(!regex.is_match("llama-3"));
    }
}
