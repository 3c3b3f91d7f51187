//! `jarvis models`: Model tier status.

use super::CliResult;

pub async fn status(json: bool) -> CliResult {
    let config = super::load_config()?;
    let assistant = super::assistant(config).await?;
    let statuses = assistant.model_status();

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        assistant.shutdown().await;
        return Ok(());
    }

    println!("🧩 Model Tiers (backend: {})", assistant.sessions().backend());
    println!("=================");
    for s in &statuses {
        match &s.session {
            Some(info) => println!(
                "  {:<9} {:<9} {} ({}, {} token window)",
                s.tier.to_string(),
                s.state.to_string(),
                info.path.display(),
                info.architecture.as_deref().unwrap_or("unknown"),
                info.context_window
            ),
            None => {
                let path = assistant
                    .config()
                    .models
                    .path(s.tier)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not configured)".into());
                println!("  {:<9} {:<9} {}", s.tier.to_string(), s.state.to_string(), path);
                if let Some(e) = &s.last_error {
                    println!("            last load failed: {e}");
                }
            }
        }
    }

    assistant.shutdown().await;
    Ok(())
}
