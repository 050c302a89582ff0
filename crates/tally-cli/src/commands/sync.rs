use tally_core::sync::DrainOutcome;

use crate::commands::common::{open_engine, Context};
use crate::error::CliError;

pub async fn run_sync(watch: bool, context: &Context) -> Result<(), CliError> {
    if context.remote.is_none() {
        return Err(CliError::RemoteNotConfigured);
    }
    let engine = open_engine(context).await?;

    if watch {
        engine.start().await;
        println!(
            "Syncing {} collections, press Ctrl-C to stop",
            engine.config().collections.len()
        );
        tokio::signal::ctrl_c().await?;
        engine.stop().await;
        println!("{}", engine.status().await?.summary());
        return Ok(());
    }

    match engine.drain_now().await? {
        DrainOutcome::Completed(report) => {
            println!(
                "Pushed {} changes ({} failed, {} quarantined)",
                report.pushed, report.failed, report.quarantined
            );
            if report.interrupted {
                println!("Remote became unreachable; remaining changes stay queued");
                return Ok(());
            }
        }
        DrainOutcome::Offline | DrainOutcome::Skipped => {
            println!("Nothing pushed");
        }
        DrainOutcome::TimedOut => return Err(CliError::SyncTimedOut),
    }

    let pulled = engine.pull().await?;
    println!("Pulled {pulled} remote records");
    println!("{}", engine.status().await?.summary());
    Ok(())
}
