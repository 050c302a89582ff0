use crate::commands::common::{
    dead_letter_to_item, format_dead_letter_lines, open_engine, parse_mutation_id, Context,
    DeadLetterItem,
};
use crate::error::CliError;

pub async fn run_dead_letters(as_json: bool, context: &Context) -> Result<(), CliError> {
    let engine = open_engine(context).await?;
    let dead_letters = engine.dead_letters().await?;

    if as_json {
        let items = dead_letters
            .iter()
            .map(dead_letter_to_item)
            .collect::<Vec<DeadLetterItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if dead_letters.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    for line in format_dead_letter_lines(&dead_letters) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_requeue(id: &str, context: &Context) -> Result<(), CliError> {
    let id = parse_mutation_id(id)?;
    let engine = open_engine(context).await?;
    let mutation = engine
        .requeue_dead_letter(&id)
        .await
        .map_err(|error| match error {
            tally_core::Error::NotFound { .. } => CliError::DeadLetterNotFound(id.to_string()),
            other => other.into(),
        })?;

    println!("{}", mutation.id);
    Ok(())
}

pub async fn run_discard(id: &str, context: &Context) -> Result<(), CliError> {
    let id = parse_mutation_id(id)?;
    let engine = open_engine(context).await?;
    if !engine.discard_dead_letter(&id).await? {
        return Err(CliError::DeadLetterNotFound(id.to_string()));
    }

    println!("{id}");
    Ok(())
}
