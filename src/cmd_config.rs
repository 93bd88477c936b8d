use std::path::Path;

use anyhow::{Result, bail};
use serde_json::Value;

use crate::ConfigAction;
use crate::config::{API_KEY_VAR, AppConfig};

pub fn run(action: &ConfigAction, config_path: &Path) -> Result<()> {
    match action {
        ConfigAction::Init => cmd_init(config_path),
        ConfigAction::Show => cmd_show(config_path),
        ConfigAction::Set { key, value } => cmd_set(config_path, key, value),
        ConfigAction::Path => {
            println!("{}", config_path.display());
            Ok(())
        }
    }
}

fn cmd_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        bail!(
            "Config already exists at {}\nUse 'glimpse config set' to modify",
            config_path.display()
        );
    }
    let mut default = serde_json::to_value(AppConfig::default())?;
    // Leave an empty slot so the key is easy to find.
    set_nested(&mut default, "server.api_key", "")?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(config_path, serde_json::to_string_pretty(&default)?)?;
    println!("Created {}", config_path.display());
    println!(
        "Set server.api_key with 'glimpse config set' or export {API_KEY_VAR}."
    );
    Ok(())
}

fn cmd_show(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        bail!(
            "No config at {}\nRun 'glimpse config init' to create one",
            config_path.display()
        );
    }
    let content = std::fs::read_to_string(config_path)?;
    let json: Value = serde_json::from_str(&content)?;
    println!("{}", serde_json::to_string_pretty(&mask_secrets(&json))?);
    Ok(())
}

fn cmd_set(config_path: &Path, key: &str, value: &str) -> Result<()> {
    let mut json: Value = if config_path.exists() {
        serde_json::from_str(&std::fs::read_to_string(config_path)?)?
    } else {
        if let Some(p) = config_path.parent() {
            std::fs::create_dir_all(p)?;
        }
        serde_json::json!({ "version": 1 })
    };
    set_nested(&mut json, key, value)?;
    // Refuse edits that would make the file unloadable.
    if let Err(e) = serde_json::from_value::<AppConfig>(json.clone()) {
        bail!("Invalid value for {key}: {e}");
    }
    std::fs::write(config_path, serde_json::to_string_pretty(&json)?)?;
    println!("Set {} = {}", key, mask_value(key, value));
    Ok(())
}

fn set_nested(json: &mut Value, key: &str, val: &str) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        bail!("Empty key");
    };
    if parts.iter().any(|p| p.is_empty()) {
        bail!("Empty key segment in '{key}'");
    }
    let mut cur = json;
    for p in parents {
        cur = as_object(cur)
            .entry(p.to_string())
            .or_insert_with(|| serde_json::json!({}));
    }
    as_object(cur).insert(last.to_string(), typed_value(val));
    Ok(())
}

/// Replace non-objects with `{}` and return the map.
fn as_object(v: &mut Value) -> &mut serde_json::Map<String, Value> {
    if !v.is_object() {
        *v = Value::Object(serde_json::Map::new());
    }
    match v {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn typed_value(val: &str) -> Value {
    if val == "true" {
        Value::Bool(true)
    } else if val == "false" {
        Value::Bool(false)
    } else if let Ok(n) = val.parse::<u64>() {
        Value::Number(n.into())
    } else if val.starts_with('[') {
        // Lists such as server.args are given as JSON.
        serde_json::from_str(val).unwrap_or_else(|_| Value::String(val.to_string()))
    } else {
        Value::String(val.to_string())
    }
}

fn mask_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut m = serde_json::Map::new();
            for (k, v) in map {
                if is_secret_key(k) {
                    if let Value::String(s) = v {
                        m.insert(k.clone(), Value::String(mask_str(s)));
                    } else {
                        m.insert(k.clone(), v.clone());
                    }
                } else {
                    m.insert(k.clone(), mask_secrets(v));
                }
            }
            Value::Object(m)
        }
        Value::Array(a) => Value::Array(a.iter().map(mask_secrets).collect()),
        other => other.clone(),
    }
}

fn is_secret_key(key: &str) -> bool {
    let u = key.to_uppercase();
    u.contains("KEY") || u.contains("SECRET") || u.contains("TOKEN")
}

fn mask_str(s: &str) -> String {
    if s.len() <= 8 || !s.is_ascii() {
        "***".to_string()
    } else {
        format!("{}...{}", &s[..4], &s[s.len() - 4..])
    }
}

fn mask_value(key: &str, value: &str) -> String {
    if is_secret_key(key) {
        mask_str(value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_intermediate_objects_and_types_values() {
        let mut v = json!({"version": 1});
        set_nested(&mut v, "server.env.DEBUG", "true").unwrap();
        set_nested(&mut v, "timeouts.analyze_ms", "90000").unwrap();
        set_nested(&mut v, "server.args", r#"["-y", "@z_ai/mcp-server@latest"]"#).unwrap();
        set_nested(&mut v, "server.mode", "ZHIPU").unwrap();
        assert_eq!(v["server"]["env"]["DEBUG"], json!(true));
        assert_eq!(v["timeouts"]["analyze_ms"], json!(90000));
        assert_eq!(v["server"]["args"][1], "@z_ai/mcp-server@latest");
        assert_eq!(v["server"]["mode"], "ZHIPU");
        assert!(set_nested(&mut v, "", "x").is_err());
    }

    #[test]
    fn secrets_are_masked_everywhere() {
        let v = json!({"server": {"api_key": "abcd1234efgh5678", "env": {"Z_AI_API_KEY": "short"}}});
        let masked = mask_secrets(&v);
        assert_eq!(masked["server"]["api_key"], "abcd...5678");
        assert_eq!(masked["server"]["env"]["Z_AI_API_KEY"], "***");
        assert_eq!(mask_value("server.mode", "ZAI"), "ZAI");
    }

    #[test]
    fn init_then_set_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        cmd_init(&path).unwrap();
        assert!(cmd_init(&path).is_err());

        cmd_set(&path, "server.api_key", "secret-key-value").unwrap();
        cmd_set(&path, "retry.mode", "soft").unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.server.api_key.as_deref(), Some("secret-key-value"));
        assert_eq!(cfg.retry.mode, crate::config::RetryMode::Soft);
        assert_eq!(cfg.server.command, "npx");
    }

    #[test]
    fn invalid_values_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        cmd_init(&path).unwrap();
        assert!(cmd_set(&path, "retry.mode", "sometimes").is_err());
        assert!(cmd_set(&path, "timeouts.analyze_ms", "soon").is_err());
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.timeouts.analyze_ms, 60_000);
    }
}
