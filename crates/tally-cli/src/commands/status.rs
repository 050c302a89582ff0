use serde::Serialize;
use tally_core::{EngineStatus, SyncCheckpoint};

use crate::commands::common::{format_timestamp, open_engine, Context};
use crate::error::CliError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(flatten)]
    pub status: EngineStatus,
    pub remote_configured: bool,
    pub checkpoints: Vec<SyncCheckpoint>,
}

pub async fn load_status(context: &Context) -> Result<StatusReport, CliError> {
    let engine = open_engine(context).await?;
    Ok(StatusReport {
        status: engine.status().await?,
        remote_configured: context.remote.is_some(),
        checkpoints: engine.store().checkpoints().await?,
    })
}

pub fn format_status_lines(report: &StatusReport) -> Vec<String> {
    let mut lines = vec![
        format!("State: {}", report.status.state.label()),
        report.status.summary(),
    ];
    if !report.remote_configured {
        lines.push("Remote: not configured".to_string());
    }
    if let Some(at) = report.status.last_drained_at {
        lines.push(format!("Last drained: {}", format_timestamp(at)));
    }
    for checkpoint in &report.checkpoints {
        lines.push(format!(
            "Checkpoint {}: {}",
            checkpoint.collection_name,
            format_timestamp(checkpoint.last_synced_at)
        ));
    }
    lines
}

pub async fn run_status(as_json: bool, context: &Context) -> Result<(), CliError> {
    let report = load_status(context).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_status_lines(&report) {
            println!("{line}");
        }
    }
    Ok(())
}
