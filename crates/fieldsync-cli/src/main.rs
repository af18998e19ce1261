//! # FieldSync CLI
//!
//! Command-line utilities for inspecting envelopes, clocks and triage.

use anyhow::{Context, Result};
use fieldsync_agent::SqliteStore;
use fieldsync_core::{ClockComparison, TriageQueue, VectorClock};
use fieldsync_proto::{TransportEnvelope, WireFormat};
use std::env;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_TRIAGE_TAKE: usize = 20;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "inspect" => {
            if args.len() < 3 {
                eprintln!("Usage: fieldsync inspect <envelope-file>");
                std::process::exit(1);
            }
            inspect(Path::new(&args[2])).await?;
        }
        "compare" => {
            if args.len() < 4 {
                eprintln!("Usage: fieldsync compare <clock-json> <clock-json>");
                std::process::exit(1);
            }
            let left = VectorClock::from_json(&args[2]).context("Invalid first clock")?;
            let right = VectorClock::from_json(&args[3]).context("Invalid second clock")?;
            let verdict = match left.compare(&right) {
                ClockComparison::Equal => "equal",
                ClockComparison::Dominates => "first dominates",
                ClockComparison::Dominated => "first is dominated",
                ClockComparison::Concurrent => "concurrent",
            };
            println!("{left} vs {right}: {verdict}");
            println!("merged: {}", left.merge(&right));
        }
        "triage" => {
            if args.len() < 3 {
                eprintln!("Usage: fieldsync triage <db-path> [take]");
                std::process::exit(1);
            }
            let take = match args.get(3) {
                Some(raw) => raw.parse().context("Invalid take")?,
                None => DEFAULT_TRIAGE_TAKE,
            };
            triage(Path::new(&args[2]), take).await?;
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn inspect(path: &Path) -> Result<()> {
    let payload = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let format = WireFormat::detect(&payload);
    let envelope =
        TransportEnvelope::decode(&payload, format).context("Failed to decode envelope")?;

    println!("format:  {format}");
    println!("source:  {}", envelope.source_site_id);
    if let Some(device) = &envelope.source_device_id {
        println!("device:  {device}");
    }
    println!("created: {}", fieldsync_core::format_utc(&envelope.created_on_utc));
    println!("deltas:  {}", envelope.deltas.len());

    for (index, delta) in envelope.deltas.iter().enumerate() {
        println!();
        println!(
            "#{index} {} clock={} origin={}@{}",
            delta.key(),
            delta.vector_clock,
            delta.origin.site_id,
            fieldsync_core::format_utc(&delta.origin.captured_on_utc)
        );
        for change in &delta.changes {
            println!(
                "    {}: {} -> {}",
                change.field_name, change.previous_value, change.new_value
            );
        }
    }
    Ok(())
}

async fn triage(db: &Path, take: usize) -> Result<()> {
    let store = SqliteStore::open(db)
        .with_context(|| format!("Failed to open {}", db.display()))?;
    let queue = TriageQueue::new(Arc::new(store));

    let summary = queue.summary().await?;
    println!(
        "triage: {} total, {} warning, {} info",
        summary.total, summary.warning, summary.info
    );

    for item in queue.recent(take).await? {
        let risk = item
            .risk_level
            .map_or_else(|| "-".to_string(), |level| format!("{level:?}"));
        println!();
        println!(
            "[{risk}] {}/{} from {} at {}",
            item.aggregate_type,
            item.aggregate_id,
            item.origin.site_id,
            fieldsync_core::format_utc(&item.observed_on_utc)
        );
        println!("    {}", item.reason);
        for change in &item.changes {
            println!(
                "    {}: {} -> {}",
                change.field_name, change.previous_value, change.new_value
            );
        }
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"FieldSync CLI

USAGE:
    fieldsync <COMMAND> [OPTIONS]

COMMANDS:
    inspect <file>             Decode and print a JSON or CBOR envelope
    compare <clock> <clock>    Compare two vector clocks given as JSON
    triage <db-path> [take]    List the newest triage items in an agent database
    help                       Show this help message

EXAMPLES:
    fieldsync inspect outbox/north-20240501T120000000000Z.json
    fieldsync compare '{{"entries":{{"A":2}}}}' '{{"entries":{{"A":1,"B":1}}}}'
    fieldsync triage ./fieldsync.db 50
"#
    );
}
