//! Configuration file loading shared by the daemons.
//!
//! Config files are YAML with camelCase keys. Every option is recognised by
//! name: the typed structs deserialise with `deny_unknown_fields`, so a
//! misspelt option aborts startup instead of being ignored. Environment
//! variables override file values at the matching nested path, e.g.
//! `HYPERVISOR_KV_DIALTIMEOUT=10` overrides `kv.dialTimeout` (path segments
//! are matched case-insensitively against the camelCase keys).

use serde::de::DeserializeOwned;
use serde_yaml::Value;

use crate::{Error, Result};

/// The environment prefix every override carries.
pub const ENV_PREFIX: &str = "HYPERVISOR_";

/// Variables consumed by the binaries themselves, never config overrides.
const RESERVED: &[&str] = &[
    "HYPERVISOR_CONFIG",
    "HYPERVISOR_AGENT_CONFIG",
    "HYPERVISOR_SERVER",
];

/// Load a YAML config file, apply `HYPERVISOR_*` overrides and deserialise
/// into the typed configuration.
pub fn load<T: DeserializeOwned>(path: &std::path::Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::invalid_spec(format!("reading config {}: {}", path.display(), e)))?;
    from_yaml_str(&raw, std::env::vars())
}

/// Parse config YAML and apply overrides from the given variable iterator.
/// Split out from [`load`] so tests can inject variables.
pub fn from_yaml_str<T: DeserializeOwned>(
    raw: &str,
    vars: impl Iterator<Item = (String, String)>,
) -> Result<T> {
    let mut value: Value = if raw.trim().is_empty() {
        Value::Mapping(Default::default())
    } else {
        serde_yaml::from_str(raw).map_err(|e| Error::invalid_spec(format!("parsing config: {}", e)))?
    };

    for (key, raw_value) in vars {
        if RESERVED.contains(&key.as_str()) {
            continue;
        }
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        let segments: Vec<&str> = path.split('_').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            continue;
        }
        apply_override(&mut value, &segments, &raw_value);
    }

    serde_yaml::from_value(value).map_err(|e| Error::invalid_spec(format!("invalid config: {}", e)))
}

/// Walk the mapping along `segments`, matching existing keys
/// case-insensitively, and set the leaf. Missing intermediate keys are
/// created; a typo therefore surfaces as an unknown field during the typed
/// decode rather than being dropped here.
fn apply_override(value: &mut Value, segments: &[&str], raw: &str) {
    let Value::Mapping(map) = value else {
        return;
    };
    let segment = segments[0];
    let key = map
        .keys()
        .filter_map(|k| k.as_str().map(str::to_string))
        .find(|k| k.eq_ignore_ascii_case(segment))
        .unwrap_or_else(|| segment.to_ascii_lowercase());
    let key = Value::String(key);

    if segments.len() == 1 {
        map.insert(key, parse_scalar(raw));
        return;
    }

    let needs_mapping = !matches!(map.get(&key), Some(Value::Mapping(_)));
    if needs_mapping {
        map.insert(key.clone(), Value::Mapping(Default::default()));
    }
    let child = map.get_mut(&key).expect("inserted above");
    apply_override(child, &segments[1..], raw);
}

/// Interpret an override string: comma-separated values become a sequence,
/// everything else goes through the YAML scalar parser (numbers, booleans,
/// strings).
fn parse_scalar(raw: &str) -> Value {
    if raw.contains(',') {
        return Value::Sequence(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_scalar(s))
                .collect(),
        );
    }
    serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
