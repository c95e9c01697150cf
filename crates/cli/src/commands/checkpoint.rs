//! Checkpoint command - inspect committed progress

use anyhow::Context;
use clap::Subcommand;
use colored::Colorize;
use processor::{CheckpointRecord, CheckpointStore, FileCheckpointStore};
use std::path::PathBuf;

/// Checkpoint command variants
#[derive(Subcommand, Debug, Clone)]
pub enum CheckpointCommand {
    /// Print the committed record at a checkpoint location
    #[command(name = "show", about = "Show the committed checkpoint at a location")]
    Show {
        /// Checkpoint directory
        #[arg(value_name = "LOCATION")]
        location: PathBuf,

        /// Print the record as JSON
        #[arg(long)]
        json: bool,
    },
}

impl CheckpointCommand {
    /// Execute the checkpoint command
    pub async fn execute(&self) -> anyhow::Result<()> {
        match self {
            CheckpointCommand::Show { location, json } => {
                let store = FileCheckpointStore::new(location);
                let record = store
                    .load()
                    .await
                    .with_context(|| format!("reading checkpoint at {}", location.display()))?;

                match record {
                    Some(record) if *json => {
                        println!("{}", serde_json::to_string_pretty(&record)?)
                    }
                    Some(record) => print_record(&record),
                    None => println!(
                        "{} {}",
                        "No checkpoint committed at".yellow(),
                        location.display()
                    ),
                }
                Ok(())
            }
        }
    }
}

fn print_record(record: &CheckpointRecord) {
    println!(
        "{} {} (version {})",
        "Stream".bold().cyan(),
        record.stream_id.green().bold(),
        record.version
    );
    println!("  {:<24} {}", "sequence".dimmed(), record.sequence);
    println!("  {:<24} {}", "committed at".dimmed(), record.committed_at.to_rfc3339());
    match record.last_emitted_window_high_watermark {
        Some(watermark) => println!("  {:<24} {} ms", "emitted through".dimmed(), watermark),
        None => println!("  {:<24} -", "emitted through".dimmed()),
    }

    println!();
    println!(
        "  {:<10} {:>14} {:>14}",
        "partition".bold(),
        "resume from".bold(),
        "read through".bold()
    );
    for (partition, progress) in &record.offsets {
        println!(
            "  {:<10} {:>14} {:>14}",
            partition, progress.resume_from, progress.read_through
        );
    }
}
