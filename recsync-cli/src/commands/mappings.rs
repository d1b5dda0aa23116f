//! `recsync mappings`: the local value-mapping table.

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use recsync_core::ValueMapping;
use recsync_store::MappingStore;

use super::Session;

#[derive(Subcommand, Debug)]
pub enum MappingsCommand {
    /// List mappings, optionally for one map type.
    List(ListArgs),
    /// Create or replace one mapping.
    Set(SetArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long = "type", short = 't', value_name = "MAP_TYPE")]
    pub map_type: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    pub map_type: String,
    pub source_id: String,
    pub remote_id: String,

    /// Human-readable label for the source value.
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Tabled)]
struct MappingRow {
    #[tabled(rename = "type")]
    map_type: String,
    #[tabled(rename = "source id")]
    source_id: String,
    #[tabled(rename = "source name")]
    source_name: String,
    #[tabled(rename = "remote id")]
    remote_id: String,
}

pub fn run(session: &Session, command: MappingsCommand) -> Result<()> {
    let pipeline = session.pipeline(session.load_config()?)?;
    let store = pipeline.store();

    match command {
        MappingsCommand::List(args) => {
            let mappings = store.list_mappings(args.map_type.as_deref())?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&mappings)
                        .context("failed to serialize mappings JSON")?
                );
                return Ok(());
            }
            if mappings.is_empty() {
                println!("No mappings.");
                return Ok(());
            }
            let rows: Vec<MappingRow> = mappings
                .into_iter()
                .map(|m| MappingRow {
                    map_type: m.map_type,
                    source_id: m.source_id,
                    source_name: m.source_name.unwrap_or_default(),
                    remote_id: m.remote_id,
                })
                .collect();
            let mut table = Table::new(rows);
            table.with(Style::rounded());
            println!("{table}");
        }
        MappingsCommand::Set(args) => {
            if args.map_type.trim().is_empty() || args.source_id.trim().is_empty() {
                bail!("map type and source id must not be empty");
            }
            let mapping = ValueMapping {
                map_type: args.map_type.trim().to_string(),
                source_id: args.source_id.trim().to_string(),
                source_name: args.name,
                remote_id: args.remote_id.trim().to_string(),
            };
            store.upsert_mapping(&mapping)?;
            println!(
                "✓ {} '{}' -> '{}'",
                mapping.map_type, mapping.source_id, mapping.remote_id
            );
        }
    }
    Ok(())
}
