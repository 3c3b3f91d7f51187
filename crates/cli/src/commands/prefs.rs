//! `jarvis prefs`: Preference commands.

use super::CliResult;

pub async fn set(category: &str, key: &str, value: &str) -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;
    store.set_preference(category, key, value).await?;
    println!("✅ {category}/{key} = {value}");
    Ok(())
}

pub async fn list() -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;
    let prefs = store.get_all_preferences().await?;
    if prefs.is_empty() {
        println!("No preferences set.");
        return Ok(());
    }
    for p in prefs {
        println!(
            "  {}/{} = {}  (updated {})",
            p.category,
            p.key,
            p.value,
            p.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}
