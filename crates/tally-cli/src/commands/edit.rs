use crate::commands::common::{open_engine, parse_patch, Context};
use crate::error::CliError;

pub async fn run_edit(
    collection: &str,
    id: &str,
    raw_patch: &str,
    context: &Context,
) -> Result<(), CliError> {
    let patch = parse_patch(raw_patch)?;

    let engine = open_engine(context).await?;
    let stored = engine.edit(collection, id.trim(), patch).await?;

    println!("{}", stored.to_json_string()?);
    Ok(())
}
