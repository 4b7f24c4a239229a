//! Variant matrix resolution
//!
//! Expands the declarative build matrix (distribution channel × crypto
//! mode) into a deterministic, ordered list of `VariantSpec`s. Resolution
//! is a pure function: identical input always yields an identical,
//! identically-ordered output, so everything downstream (dispatch order,
//! manifest order) is reproducible.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors from matrix resolution. All are fatal before any job starts.
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("matrix axis '{axis}' is empty")]
    EmptyAxis { axis: &'static str },

    #[error("matrix axis '{axis}' contains duplicate value '{value}'")]
    DuplicateValue { axis: &'static str, value: String },

    #[error("{list} entry references undefined {axis} '{value}'")]
    UnknownValue {
        list: &'static str,
        axis: &'static str,
        value: String,
    },

    #[error("matrix resolves to no variants (every combination excluded)")]
    AllExcluded,
}

/// A (channel, crypto mode) pair used by exclusion and optional lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSelector {
    /// Distribution channel name
    pub channel: String,
    /// Crypto mode name
    pub crypto_mode: String,
}

/// Declarative matrix definition (the `[matrix]` table in varship.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    /// Distribution channel axis (e.g., "play", "foss")
    pub channels: Vec<String>,

    /// Crypto mode axis (e.g., "standard", "strong")
    pub crypto_modes: Vec<String>,

    /// Invalid combinations, removed from the product
    #[serde(default)]
    pub exclude: Vec<VariantSelector>,

    /// Combinations whose failure does not block publication
    #[serde(default)]
    pub optional: Vec<VariantSelector>,

    /// Output filename templates per variant; `{name}`, `{channel}` and
    /// `{crypto_mode}` are substituted. Normally one output, but a
    /// variant may declare several (e.g., binary + debug symbols).
    #[serde(default = "default_outputs")]
    pub outputs: Vec<String>,
}

fn default_outputs() -> Vec<String> {
    vec!["{name}.apk".to_string()]
}

/// One buildable product configuration, produced only by [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSpec {
    /// Variant name: `<channel>-<crypto_mode>`
    pub name: String,
    /// Distribution channel
    pub channel: String,
    /// Crypto mode
    pub crypto_mode: String,
    /// Whether this variant must succeed for a release to publish
    pub required: bool,
    /// Declared output filenames (templates expanded)
    pub outputs: Vec<String>,
}

impl VariantSpec {
    fn matches(&self, sel: &VariantSelector) -> bool {
        self.channel == sel.channel && self.crypto_mode == sel.crypto_mode
    }
}

/// Expand the matrix into an ordered list of variants.
///
/// Output is sorted by (channel, crypto mode) regardless of the order
/// axes were declared in. Exclusions are applied after expansion; an
/// exclusion or optional entry naming an undefined axis value is an
/// error rather than being silently ignored.
pub fn resolve(config: &MatrixConfig) -> Result<Vec<VariantSpec>, MatrixError> {
    let channels = validated_axis("channels", &config.channels)?;
    let crypto_modes = validated_axis("crypto_modes", &config.crypto_modes)?;

    for sel in &config.exclude {
        check_selector("exclude", sel, &channels, &crypto_modes)?;
    }
    for sel in &config.optional {
        check_selector("optional", sel, &channels, &crypto_modes)?;
    }

    let mut variants = Vec::new();
    for channel in &channels {
        for crypto_mode in &crypto_modes {
            let name = format!("{channel}-{crypto_mode}");
            let mut spec = VariantSpec {
                name: name.clone(),
                channel: channel.clone(),
                crypto_mode: crypto_mode.clone(),
                required: true,
                outputs: Vec::new(),
            };

            if config.exclude.iter().any(|sel| spec.matches(sel)) {
                continue;
            }
            if config.optional.iter().any(|sel| spec.matches(sel)) {
                spec.required = false;
            }

            spec.outputs = config
                .outputs
                .iter()
                .map(|template| {
                    template
                        .replace("{name}", &name)
                        .replace("{channel}", channel)
                        .replace("{crypto_mode}", crypto_mode)
                })
                .collect();

            variants.push(spec);
        }
    }

    if variants.is_empty() {
        return Err(MatrixError::AllExcluded);
    }

    Ok(variants)
}

/// Validate an axis and return its values sorted for stable iteration.
fn validated_axis(axis: &'static str, values: &[String]) -> Result<Vec<String>, MatrixError> {
    if values.is_empty() {
        return Err(MatrixError::EmptyAxis { axis });
    }

    let mut seen = BTreeSet::new();
    for value in values {
        if !seen.insert(value.clone()) {
            return Err(MatrixError::DuplicateValue {
                axis,
                value: value.clone(),
            });
        }
    }

    Ok(seen.into_iter().collect())
}

fn check_selector(
    list: &'static str,
    sel: &VariantSelector,
    channels: &[String],
    crypto_modes: &[String],
) -> Result<(), MatrixError> {
    if !channels.contains(&sel.channel) {
        return Err(MatrixError::UnknownValue {
            list,
            axis: "channel",
            value: sel.channel.clone(),
        });
    }
    if !crypto_modes.contains(&sel.crypto_mode) {
        return Err(MatrixError::UnknownValue {
            list,
            axis: "crypto_mode",
            value: sel.crypto_mode.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_two() -> MatrixConfig {
        MatrixConfig {
            channels: vec!["play".to_string(), "foss".to_string()],
            crypto_modes: vec!["standard".to_string(), "strong".to_string()],
            exclude: Vec::new(),
            optional: Vec::new(),
            outputs: default_outputs(),
        }
    }

    #[test]
    fn test_full_product() {
        let variants = resolve(&two_by_two()).unwrap();
        let names: Vec<_> = variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["foss-standard", "foss-strong", "play-standard", "play-strong"]
        );
        assert!(variants.iter().all(|v| v.required));
    }

    #[test]
    fn test_order_independent_of_declaration_order() {
        let mut reversed = two_by_two();
        reversed.channels.reverse();
        reversed.crypto_modes.reverse();

        assert_eq!(resolve(&two_by_two()).unwrap(), resolve(&reversed).unwrap());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let config = two_by_two();
        assert_eq!(resolve(&config).unwrap(), resolve(&config).unwrap());
    }

    #[test]
    fn test_exclusion_removes_combination() {
        let mut config = two_by_two();
        config.exclude.push(VariantSelector {
            channel: "play".to_string(),
            crypto_mode: "strong".to_string(),
        });

        let variants = resolve(&config).unwrap();
        assert_eq!(variants.len(), 3);
        assert!(!variants.iter().any(|v| v.name == "play-strong"));
    }

    #[test]
    fn test_optional_marks_variant() {
        let mut config = two_by_two();
        config.optional.push(VariantSelector {
            channel: "foss".to_string(),
            crypto_mode: "strong".to_string(),
        });

        let variants = resolve(&config).unwrap();
        let foss_strong = variants.iter().find(|v| v.name == "foss-strong").unwrap();
        assert!(!foss_strong.required);
        assert_eq!(
            variants.iter().filter(|v| v.required).count(),
            variants.len() - 1
        );
    }

    #[test]
    fn test_empty_axis_rejected() {
        let mut config = two_by_two();
        config.crypto_modes.clear();

        let err = resolve(&config).unwrap_err();
        assert!(matches!(
            err,
            MatrixError::EmptyAxis {
                axis: "crypto_modes"
            }
        ));
    }

    #[test]
    fn test_duplicate_axis_value_rejected() {
        let mut config = two_by_two();
        config.channels.push("play".to_string());

        let err = resolve(&config).unwrap_err();
        assert!(matches!(err, MatrixError::DuplicateValue { .. }));
    }

    #[test]
    fn test_unknown_exclusion_rejected() {
        let mut config = two_by_two();
        config.exclude.push(VariantSelector {
            channel: "amazon".to_string(),
            crypto_mode: "standard".to_string(),
        });

        let err = resolve(&config).unwrap_err();
        assert!(matches!(
            err,
            MatrixError::UnknownValue {
                list: "exclude",
                axis: "channel",
                ..
            }
        ));
    }

    #[test]
    fn test_everything_excluded_rejected() {
        let mut config = two_by_two();
        for channel in &config.channels.clone() {
            for mode in &config.crypto_modes.clone() {
                config.exclude.push(VariantSelector {
                    channel: channel.clone(),
                    crypto_mode: mode.clone(),
                });
            }
        }

        assert!(matches!(resolve(&config), Err(MatrixError::AllExcluded)));
    }

    #[test]
    fn test_output_templates_expand() {
        let mut config = two_by_two();
        config.outputs = vec![
            "app-{channel}-{crypto_mode}.apk".to_string(),
            "{name}-symbols.zip".to_string(),
        ];

        let variants = resolve(&config).unwrap();
        let play_standard = variants.iter().find(|v| v.name == "play-standard").unwrap();
        assert_eq!(
            play_standard.outputs,
            vec!["app-play-standard.apk", "play-standard-symbols.zip"]
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_src = r#"
            channels = ["play", "foss"]
            crypto_modes = ["standard"]

            [[optional]]
            channel = "foss"
            crypto_mode = "standard"
        "#;

        let config: MatrixConfig = toml::from_str(toml_src).unwrap();
        let variants = resolve(&config).unwrap();
        assert_eq!(variants.len(), 2);
        assert!(!variants.iter().find(|v| v.name == "foss-standard").unwrap().required);
    }
}
