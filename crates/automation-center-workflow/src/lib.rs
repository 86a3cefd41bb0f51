#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use automation_center_domain::{
    compute_definition_hash, ensure_non_empty, hash_bytes, AutomationDefinition,
    AutomationEnvelope, StepDefinition,
};

/// Load an automation definition YAML file and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_definition_from_path(path: &Path) -> Result<AutomationEnvelope> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read automation definition {}", path.display()))?;
    normalize_definition_yaml(&content)
}

/// Parse, validate, and normalize automation YAML into a hashed envelope.
///
/// # Errors
/// Returns an error when YAML parsing, validation, or hashing fails.
pub fn normalize_definition_yaml(yaml: &str) -> Result<AutomationEnvelope> {
    let source_hash = hash_bytes(yaml.as_bytes());
    let mut definition: AutomationDefinition = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid automation YAML structure: {err}"))?;

    normalize_definition(&mut definition);
    ensure_non_empty("automation_name", &definition.automation_name)?;
    ensure_non_empty("automation_version", &definition.automation_version)?;
    validate_step_definitions(&definition.steps)?;

    let definition_hash = compute_definition_hash(&definition.steps)?;

    Ok(AutomationEnvelope {
        source_format: "yaml".to_string(),
        source_hash,
        definition_hash,
        definition,
    })
}

/// Check that a step sequence can be materialized into a run.
///
/// # Errors
/// Returns an error when the sequence is empty, a key or kind is blank, or a
/// step key repeats.
pub fn validate_step_definitions(steps: &[StepDefinition]) -> Result<()> {
    if steps.is_empty() {
        return Err(anyhow!("at least one step definition is required"));
    }

    let mut keys = BTreeSet::new();
    for (ordinal, step) in steps.iter().enumerate() {
        ensure_non_empty("step_key", &step.step_key)
            .with_context(|| format!("step at position {ordinal}"))?;
        ensure_non_empty("kind", &step.kind)
            .with_context(|| format!("step {}", step.step_key))?;
        if !keys.insert(step.step_key.trim()) {
            return Err(anyhow!("duplicate step_key: {}", step.step_key.trim()));
        }
    }
    Ok(())
}

/// Trim keys, lowercase kinds, and replace a missing input with `{}`.
pub fn normalize_step_definitions(steps: &mut [StepDefinition]) {
    for step in steps {
        step.step_key = step.step_key.trim().to_string();
        step.kind = step.kind.trim().to_ascii_lowercase();
        if step.input.is_null() {
            step.input = serde_json::Value::Object(serde_json::Map::default());
        }
    }
}

fn normalize_definition(definition: &mut AutomationDefinition) {
    definition.automation_name = definition.automation_name.trim().to_string();
    definition.automation_version = definition.automation_version.trim().to_string();
    normalize_step_definitions(&mut definition.steps);
}
