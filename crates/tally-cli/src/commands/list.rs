use tally_core::Record;

use crate::commands::common::{format_record_line, open_engine, Context};
use crate::error::CliError;

pub async fn list_records(
    collection: &str,
    limit: Option<usize>,
    context: &Context,
) -> Result<Vec<Record>, CliError> {
    let engine = open_engine(context).await?;
    let mut records = engine.list(collection).await?;
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    Ok(records)
}

pub async fn run_list(
    collection: &str,
    limit: Option<usize>,
    as_json: bool,
    context: &Context,
) -> Result<(), CliError> {
    let records = list_records(collection, limit, context).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No records in {collection}.");
    } else {
        for record in &records {
            println!("{}", format_record_line(record));
        }
    }

    Ok(())
}
