pub mod types;

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

pub use types::{BypassConfig, Config, CustomRule, LogConfig, NetworkMode, OutboundConfig};

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env var regex is valid")
});

/// 读取并校验 YAML 配置
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config '{}'", path.display()))?;
    let mut config = parse_config(&raw)?;

    // 相对规则文件路径按配置文件所在目录解析
    if config.bypass.file.is_relative() {
        if let Some(dir) = path.parent() {
            config.bypass.file = dir.join(&config.bypass.file);
        }
    }
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let expanded = expand_env_vars(content);
    let mut config: Config = serde_yml::from_str(&expanded).context("invalid config")?;
    config.normalize();
    config.validate()?;
    Ok(config)
}

/// 展开 `${VAR}` 与 `${VAR:-default}`；未定义且无默认值的变量替换为空
pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match (std::env::var(&caps[1]), caps.get(2)) {
                (Ok(val), Some(_)) if !val.is_empty() => val,
                (Ok(val), None) => val,
                (_, Some(default)) => default.as_str().to_string(),
                (Err(_), None) => String::new(),
            }
        })
        .into_owned()
}
