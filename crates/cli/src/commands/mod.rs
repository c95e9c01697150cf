//! CLI command implementations

pub mod checkpoint;
pub mod run;

pub use checkpoint::CheckpointCommand;
pub use run::RunCommand;

use colored::Colorize;
use tradeflow_config::AppConfig;

/// Print the effective configuration
pub fn print_summary(config: &AppConfig) {
    println!("{}", "Effective configuration:".bold().cyan());
    println!("  {:<18} {}", "service".dimmed(), config.service.name);
    println!(
        "  {:<18} {} @ {}",
        "source".dimmed(),
        config.source.topic,
        config.source.brokers
    );
    println!("  {:<18} {}", "group".dimmed(), config.source.group_id);
    println!(
        "  {:<18} {:?} (data loss {})",
        "starting offsets".dimmed(),
        config.source.starting_offsets,
        if config.source.fail_on_data_loss {
            "fails"
        } else {
            "skipped"
        }
    );
    println!(
        "  {:<18} {} ms, lateness {} ms, delay {} ms",
        "window".dimmed(),
        config.processor.window.size_ms,
        config.processor.window.allowed_lateness_ms,
        config.processor.watermark.max_delay_ms
    );
    println!(
        "  {:<18} {:?} {} ({})",
        "storage".dimmed(),
        config.storage.backend,
        config.storage.path.display(),
        config.storage.keyspace
    );
    println!(
        "  {:<18} {}, {}",
        "checkpoints".dimmed(),
        config.processor.checkpoint.raw_location.display(),
        config.processor.checkpoint.windowed_location.display()
    );
    println!(
        "  {:<18} {}",
        "dead letters".dimmed(),
        config.dead_letter.path.display()
    );
}
