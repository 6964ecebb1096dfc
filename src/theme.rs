//! Campaign theme utilities.
//!
//! Theme config lives as JSONB on `quiz_themes.config`; changing a campaign's
//! look is a data update, not a code change. Rows may carry only the fields
//! they override, so the stored config is merged over built-in defaults
//! before it is handed to callers.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Resolved theme handed to rendering clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeConfig {
    pub primary_color: String,
    pub background_color: String,
    pub card_color: String,
    pub button_color: String,
    pub button_text_color: String,
    pub button_radius: String,
    pub correct_color: String,
    pub wrong_color: String,
    pub font_family: String,
    pub title_font_size: String,
    pub question_font_size: String,
    pub progress_bar_color: String,
    pub shadow_color: String,
}

lazy_static! {
    /// Defaults applied for any field the stored config omits
    pub static ref DEFAULT_THEME: ThemeConfig = ThemeConfig {
        primary_color: "#FF6B9D".to_string(),
        background_color: "#FFF5E4".to_string(),
        card_color: "#FFFFFF".to_string(),
        button_color: "#FF6B9D".to_string(),
        button_text_color: "#FFFFFF".to_string(),
        button_radius: "12px".to_string(),
        correct_color: "#2ECC71".to_string(),
        wrong_color: "#E74C3C".to_string(),
        font_family: "sans-serif".to_string(),
        title_font_size: "1.5rem".to_string(),
        question_font_size: "1.1rem".to_string(),
        progress_bar_color: "#FF6B9D".to_string(),
        shadow_color: "rgba(255, 107, 157, 0.2)".to_string(),
    };
}

/// Merge a stored JSONB config over the defaults.
///
/// Unknown keys and non-string values in the stored config are ignored
/// rather than rejected; a partially-authored theme must never break a scan.
pub fn merge_theme(db_config: &Value) -> ThemeConfig {
    let mut merged = match serde_json::to_value(&*DEFAULT_THEME) {
        Ok(Value::Object(map)) => map,
        _ => return DEFAULT_THEME.clone(),
    };

    if let Value::Object(overrides) = db_config {
        for (key, value) in overrides {
            if merged.contains_key(key) && value.is_string() {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    serde_json::from_value(Value::Object(merged)).unwrap_or_else(|_| DEFAULT_THEME.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_config_yields_defaults() {
        let theme = merge_theme(&json!({}));
        assert_eq!(theme, *DEFAULT_THEME);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let theme = merge_theme(&json!({
            "primaryColor": "#112233",
            "buttonRadius": "4px",
        }));
        assert_eq!(theme.primary_color, "#112233");
        assert_eq!(theme.button_radius, "4px");
        // Untouched fields keep their defaults
        assert_eq!(theme.card_color, DEFAULT_THEME.card_color);
    }

    #[test]
    fn test_unknown_and_malformed_keys_are_ignored() {
        let theme = merge_theme(&json!({
            "sparkleIntensity": "11",
            "primaryColor": 42,
            "backgroundColor": "#000000",
        }));
        assert_eq!(theme.primary_color, DEFAULT_THEME.primary_color);
        assert_eq!(theme.background_color, "#000000");
    }

    #[test]
    fn test_non_object_config_yields_defaults() {
        assert_eq!(merge_theme(&json!(null)), *DEFAULT_THEME);
        assert_eq!(merge_theme(&json!("pink")), *DEFAULT_THEME);
    }
}
