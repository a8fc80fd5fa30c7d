use anyhow::{Result, anyhow};
use console::style;
use std::path::Path;

use crate::core::config::{DEFAULT_HOST, DEFAULT_PORT, PipelineConfig};
use crate::core::store::AlertStore;
use crate::core::store::types::DeadLetterArchiveRecord;
use crate::core::terminal::{GuideSection, print_info, print_warn};
use crate::platform::{NativePlatform, Platform};

fn count(map: &serde_json::Value, key: &str) -> u64 {
    map.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn counts_line(map: &serde_json::Value, keys: &[&str]) -> String {
    keys.iter()
        .map(|k| format!("{} {}", k.to_lowercase(), count(map, k)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Host and port from the config file, falling back to the defaults when
/// it cannot be loaded.
pub async fn configured_server(config_path: Option<&Path>) -> (String, u16) {
    match PipelineConfig::load(config_path, &NativePlatform::data_dir()).await {
        Ok(config) => (config.server.host, config.server.port),
        Err(_) => (DEFAULT_HOST.to_string(), DEFAULT_PORT),
    }
}

/// Query a running daemon over HTTP and print its status snapshot.
pub async fn show_status(api_host: &str, api_port: u16) -> Result<()> {
    let url = format!("http://{}:{}/api/status", api_host, api_port);
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;
    let resp = match client.get(&url).send().await {
        Ok(resp) => resp,
        Err(e) => {
            GuideSection::new("Pipeline Status")
                .status("Daemon", &style("UNREACHABLE").red().bold().to_string())
                .blank()
                .warn(&format!("{} ({})", url, e))
                .info(&format!(
                    "Run {} to start it.",
                    style("alert-relay run").cyan().bold()
                ))
                .print();
            println!();
            return Ok(());
        }
    };
    if !resp.status().is_success() {
        return Err(anyhow!("status endpoint returned {}", resp.status()));
    }
    let status: serde_json::Value = resp.json().await?;

    let health = &status["compensation_health"];
    let level = health["level"].as_str().unwrap_or("unknown");
    let styled_level = match level {
        "healthy" => style(level.to_uppercase()).green().bold(),
        "warning" => style(level.to_uppercase()).yellow().bold(),
        _ => style(level.to_uppercase()).red().bold(),
    };
    let depth = |v: &serde_json::Value| {
        v.as_u64()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    };

    GuideSection::new("Pipeline Status")
        .status("Daemon", &style("RUNNING").green().bold().to_string())
        .status(
            "Publish",
            &counts_line(
                &status["publish"],
                &["PENDING", "COMPENSATING", "ENQUEUED", "FAILED"],
            ),
        )
        .status(
            "Notifications",
            &counts_line(
                &status["notifications"],
                &[
                    "PENDING",
                    "SENDING",
                    "DELIVERED",
                    "ACK_RECEIVED",
                    "EXPIRED",
                    "FAILED",
                ],
            ),
        )
        .status(
            "Queues",
            &format!(
                "main {}, dead-letter {}",
                depth(&status["main_queue_depth"]),
                depth(&status["dead_letter_depth"])
            ),
        )
        .status("Clients", &status["connected_clients"].to_string())
        .status(
            "Merge",
            &format!(
                "{} open group(s), {} flushed",
                status["merge"]["active_groups"], status["merge"]["flushed"]
            ),
        )
        .status(
            "Compensation",
            &format!(
                "{} (score {}, {} cycle(s))",
                styled_level, health["score"], status["compensation"]["total_cycles"]
            ),
        )
        .print();

    if let Some(issues) = health["issues"].as_array()
        && !issues.is_empty()
    {
        let mut section = GuideSection::new("Issues");
        for issue in issues {
            section = section.warn(issue.as_str().unwrap_or_default());
        }
        section.print();
    }

    let failures = &status["recent_failures"];
    let mut section = GuideSection::new("Recent Failures");
    let mut any = false;
    for (label, key) in [
        ("publish", "publish"),
        ("notify", "notifications"),
        ("dead-letter", "dead_letters"),
    ] {
        for f in failures[key].as_array().into_iter().flatten() {
            any = true;
            section = section.text(&format!(
                "{:<12} {} {}",
                style(label).dim(),
                f["id"].as_str().unwrap_or("?"),
                style(f["last_error"].as_str().unwrap_or("")).red()
            ));
        }
    }
    if any {
        section.print();
    }
    println!();
    Ok(())
}

fn print_dead_letter(record: &DeadLetterArchiveRecord) {
    println!(
        "  {} {} {}",
        style(format!("#{}", record.id)).bold(),
        style(record.archived_at.format("%Y-%m-%d %H:%M:%S")).dim(),
        record.alert_id.as_deref().unwrap_or("<unparseable>")
    );
    println!(
        "      {} deaths {}, retries {}, {}",
        style(&record.dead_reason).yellow(),
        record.death_count,
        record.retry_count,
        record.reason
    );
}

/// List the permanent-failure archive straight from the database.
pub async fn list_dead_letters(limit: usize) -> Result<()> {
    let data_dir = NativePlatform::data_dir();
    if !data_dir.join(crate::core::store::DB_FILE_NAME).exists() {
        print_warn("No alert-relay database found. Start the daemon first.");
        return Ok(());
    }
    let store = AlertStore::open(&data_dir).await?;
    let total = store.count_dead_letter_archive().await?;
    let records = store.list_dead_letter_archive(limit).await?;
    if records.is_empty() {
        print_info("Dead-letter archive is empty.");
        return Ok(());
    }

    GuideSection::new("Dead-Letter Archive")
        .status("Archived", &total.to_string())
        .status("Showing", &records.len().to_string())
        .print();
    for record in &records {
        print_dead_letter(record);
    }
    println!();
    Ok(())
}

/// Load and validate the configuration, then print it as TOML.
pub async fn show_config(config_path: Option<&Path>) -> Result<()> {
    let data_dir = NativePlatform::data_dir();
    let config = PipelineConfig::load(config_path, &data_dir).await?;
    let rendered = toml::to_string_pretty(&config)?;
    GuideSection::new("Configuration")
        .status(
            "Source",
            &config_path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| {
                    data_dir
                        .join(crate::core::config::CONFIG_FILE_NAME)
                        .display()
                        .to_string()
                }),
        )
        .status("Valid", &style("yes").green().to_string())
        .print();
    println!("\n{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_line_defaults_missing_states() {
        let map = serde_json::json!({ "ENQUEUED": 4, "FAILED": 1 });
        assert_eq!(
            counts_line(&map, &["PENDING", "ENQUEUED", "FAILED"]),
            "pending 0, enqueued 4, failed 1"
        );
    }
}
