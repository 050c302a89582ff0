use crate::commands::common::{open_engine, parse_record, Context};
use crate::error::CliError;

pub async fn run_add(collection: &str, raw_record: &str, context: &Context) -> Result<(), CliError> {
    let record = parse_record(raw_record)?;

    let engine = open_engine(context).await?;
    let stored = engine.add(collection, record).await?;

    println!("{}", stored.to_json_string()?);
    Ok(())
}
