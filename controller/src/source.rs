//! Source handles the source template and Overlay payloads: environment
//! expansion on the textual form, then YAML parsing into a value tree.

use std::{path::Path, sync::LazyLock};

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use api::v1::Overlay;

use crate::Result;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([^}]*)\}|([A-Za-z_][A-Za-z0-9_]*))").expect("env reference pattern")
});

/// Expand substitutes `$VAR` and `${VAR}` references with values from the
/// process environment. Unset variables expand to the empty string.
pub fn expand(text: &str) -> String {
    ENV_REFERENCE
        .replace_all(text, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

/// Parse expands environment references in `text` and parses it as YAML.
pub fn parse(text: &str) -> Result<Value> {
    Ok(serde_yaml::from_str(&expand(text))?)
}

/// Load reads, expands, and parses the source template at `path`.
pub async fn load(path: &Path) -> Result<Value> {
    let text = tokio::fs::read_to_string(path).await?;
    parse(&text)
}

/// Payload returns the Overlay's `spec.data` with environment references in
/// its textual form expanded. A missing or null payload is an empty mapping.
pub fn payload(overlay: &Overlay) -> Result<Value> {
    match &overlay.spec.data {
        Some(Value::Null) | None => Ok(Value::Object(Map::new())),
        Some(data) => parse(&serde_json::to_string(data)?),
    }
}
