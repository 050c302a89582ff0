use crate::commands::common::{open_engine, Context};
use crate::error::CliError;

pub async fn run_remove(collection: &str, id: &str, context: &Context) -> Result<(), CliError> {
    let id = id.trim();
    let engine = open_engine(context).await?;
    engine.remove(collection, id).await?;

    println!("{id}");
    Ok(())
}
