use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority. Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/mitto/config.yaml"));
    paths.push(PathBuf::from("/etc/mitto/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/mitto/config.yaml"));
        paths.push(home.join(".config/mitto/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("mitto/config.yaml"));
        paths.push(cfg.join("mitto/config.yml"));
    }

    paths.push(PathBuf::from(".mitto/config.yaml"));
    paths.push(PathBuf::from(".mitto/config.yml"));
    paths.push(PathBuf::from("mitto.yaml"));
    paths.push(PathBuf::from("mitto.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files. `extra` may
/// provide an explicit path (e.g. a `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    check_unknown_top_level_keys(&merged)?;

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("deserializing merged configuration")?
    };
    validate_workspaces(&config)?;
    Ok(config)
}

/// Top-level fields `Config` actually deserializes. Kept separate from
/// `serde(deny_unknown_fields)` on the struct itself because that
/// attribute would also reject forward-compatible fields written by a
/// newer `mitto` version reading an older host's config; checking the
/// merged value instead lets us report exactly which key is unrecognized.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "bind_address",
    "permission_timeout_secs",
    "data_root",
    "observer_idle_timeout_secs",
    "queue_title_timeout_secs",
    "workspaces",
];

fn check_unknown_top_level_keys(merged: &serde_yaml::Value) -> anyhow::Result<()> {
    let serde_yaml::Value::Mapping(map) = merged else {
        return Ok(());
    };
    for key in map.keys() {
        let Some(key) = key.as_str() else {
            anyhow::bail!("configuration key must be a string");
        };
        if !KNOWN_TOP_LEVEL_KEYS.contains(&key) {
            anyhow::bail!(
                "unknown configuration key {key:?}; expected one of {KNOWN_TOP_LEVEL_KEYS:?}"
            );
        }
    }
    Ok(())
}

/// Workspace-table checks that have no analogue in a single-agent config:
/// every workspace needs somewhere to run and something to run, and a
/// queue that can never accept a message is a misconfiguration rather
/// than a degenerate-but-valid `max_size`.
fn validate_workspaces(config: &Config) -> anyhow::Result<()> {
    for (name, ws) in &config.workspaces {
        if ws.agent_name.trim().is_empty() {
            anyhow::bail!("workspace {name:?} has an empty agent_name");
        }
        if ws.root.as_os_str().is_empty() {
            anyhow::bail!("workspace {name:?} has no root directory configured");
        }
        if ws.queue.max_size == 0 {
            anyhow::bail!("workspace {name:?} queue.max_size must be at least 1");
        }
    }
    Ok(())
}

/// Deep-merge `src` into `dst`; `src` wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("a:\n  bind_address: 127.0.0.1:4000\n  data_root: /var/lib\n");
        let src = val("a:\n  data_root: /srv/mitto\n");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"]["bind_address"].as_str(), Some("127.0.0.1:4000"));
        assert_eq!(dst["a"]["data_root"].as_str(), Some("/srv/mitto"));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/mitto_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.bind_address, "127.0.0.1:4000");
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "bind_address: 0.0.0.0:9000\npermission_timeout_secs: 60\n").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.bind_address, "0.0.0.0:9000");
        assert_eq!(cfg.permission_timeout_secs, 60);
    }

    #[test]
    fn load_explicit_file_with_workspace_table() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "workspaces:\n  demo:\n    root: /tmp/demo\n    agent_name: claude\n"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        let ws = cfg.workspaces.get("demo").unwrap();
        assert_eq!(ws.agent_name, "claude");
        assert_eq!(ws.queue.max_size, 50);
    }

    #[test]
    fn load_rejects_unknown_top_level_key() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "bind_addres: 0.0.0.0:9000\n").unwrap();
        let err = load(Some(f.path())).unwrap_err();
        assert!(err.to_string().contains("bind_addres"));
    }

    #[test]
    fn load_rejects_workspace_with_empty_agent_name() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "workspaces:\n  demo:\n    root: /tmp/demo\n    agent_name: \"\"\n").unwrap();
        let err = load(Some(f.path())).unwrap_err();
        assert!(err.to_string().contains("demo"));
    }

    #[test]
    fn load_rejects_workspace_with_zero_queue_max_size() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "workspaces:\n  demo:\n    root: /tmp/demo\n    agent_name: claude\n    queue:\n      max_size: 0\n"
        )
        .unwrap();
        let err = load(Some(f.path())).unwrap_err();
        assert!(err.to_string().contains("max_size"));
    }
}
