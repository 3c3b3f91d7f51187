//! `jarvis memory`: Memory management commands.

use super::CliResult;

pub async fn add(content: &str, category: &str, importance: i32) -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;
    let id = store.add_memory(content, category, importance).await?;
    println!("🧠 Stored memory #{id} ({category}, importance {})", importance.clamp(0, 10));
    Ok(())
}

pub async fn search(query: &str, limit: usize) -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;

    println!("🔍 Searching memories for: \"{query}\"");
    println!();

    let results = store.search_memories(query, limit).await?;
    if results.is_empty() {
        println!("   No memories found.");
    }
    for (i, entry) in results.iter().enumerate() {
        let preview: String = entry.content.chars().take(80).collect();
        println!(
            "  {:>2}. [score: {:.2}] {} ({}, importance {}, {})",
            i + 1,
            entry.score,
            preview,
            entry.category,
            entry.importance,
            entry.created_at.format("%Y-%m-%d")
        );
    }
    Ok(())
}

pub async fn context(query: &str) -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;
    let digest = store
        .build_digest(query, config.memory.recall_limit, config.memory.context_tokens)
        .await?;
    if digest.is_empty() {
        println!("(no memory context)");
    } else {
        println!("{}", digest.text);
    }
    Ok(())
}

pub async fn delete(id: i64) -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;
    if store.delete_memory(id).await? {
        println!("🗑️  Deleted memory #{id}");
        Ok(())
    } else {
        Err(format!("No memory with id {id}").into())
    }
}

pub async fn stats() -> CliResult {
    let config = super::load_config()?;
    let store = super::open_memory(&config).await?;
    let stats = store.stats().await?;

    println!("📊 Memory Stats ({})", store.name());
    println!("================");
    println!("  User:        {}", stats.user_name.as_deref().unwrap_or("(unknown)"));
    println!("  Facts:       {}", stats.fact_count);
    println!("  Preferences: {}", stats.preference_count);
    println!("  Memories:    {}", stats.memory_count);

    let important = store.important_memories(7, 5).await?;
    if !important.is_empty() {
        println!();
        println!("  Most important:");
        for m in important {
            println!("    #{} [{}] {}", m.id, m.importance, m.content);
        }
    }
    Ok(())
}
