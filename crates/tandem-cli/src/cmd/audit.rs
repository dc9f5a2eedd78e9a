use crate::output::{print_json, print_table, short_time};
use crate::root::require_initialized;
use anyhow::Context;
use clap::Args;
use std::path::Path;
use tandem_core::audit::{AuditLog, AuditOperation};

#[derive(Args)]
pub struct AuditArgs {
    /// Only entries for this operation (e.g. acquire, force_break)
    #[arg(long)]
    op: Option<AuditOperation>,

    /// Only the last N entries
    #[arg(long)]
    tail: Option<usize>,
}

pub fn run(root: &Path, args: AuditArgs, json: bool) -> anyhow::Result<()> {
    require_initialized(root)?;
    let log = AuditLog::new(root);
    let mut entries = match args.op {
        Some(op) => log.filter(op),
        None => log.read_all(),
    }
    .context("failed to read audit log")?;
    if let Some(n) = args.tail {
        let skip = entries.len().saturating_sub(n);
        entries.drain(..skip);
    }

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                short_time(&e.timestamp),
                e.operation.to_string(),
                e.actor.clone(),
                if e.success { "ok" } else { "FAILED" }.to_string(),
                e.details.clone(),
            ]
        })
        .collect();
    print_table(&["TIME", "OPERATION", "ACTOR", "RESULT", "DETAILS"], rows);
    Ok(())
}
