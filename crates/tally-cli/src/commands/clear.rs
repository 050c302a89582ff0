use crate::commands::common::{open_engine, Context};
use crate::error::CliError;

pub async fn run_clear(confirmed: bool, context: &Context) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::ConfirmationRequired);
    }

    let engine = open_engine(context).await?;
    engine.clear_all().await?;
    println!("Local data cleared");
    Ok(())
}
