//! `jarvis config`: Print the effective configuration.

use super::CliResult;
use jarvis_config::AppConfig;

pub fn show() -> CliResult {
    let config = super::load_config()?;
    let path = AppConfig::config_dir().join("config.toml");
    if path.exists() {
        println!("# Loaded from {}", path.display());
    } else {
        println!("# No config file at {}; defaults shown", path.display());
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
