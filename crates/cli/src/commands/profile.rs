//! `jarvis profile`: User profile commands.

use super::CliResult;

pub async fn show() -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;
    let profile = store.get_profile().await?;

    println!("👤 User Profile");
    println!("===============");
    println!("  Name:     {}", profile.name.as_deref().unwrap_or("(unknown)"));
    match profile.updated_at {
        Some(at) => println!("  Updated:  {}", at.format("%Y-%m-%d %H:%M")),
        None => println!("  Updated:  never"),
    }
    println!("  Memories: {}", store.memory_count().await?);
    if profile.facts.is_empty() {
        println!("  Facts:    none");
    } else {
        println!("  Facts:");
        for fact in &profile.facts {
            println!("    - {fact}");
        }
    }
    Ok(())
}

pub async fn set_name(name: &str) -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;
    store.set_name(name).await?;
    println!("✅ Name set to {name}");
    Ok(())
}

pub async fn add_fact(fact: &str) -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;
    store.add_user_fact(fact).await?;
    println!("✅ Fact added");
    Ok(())
}
