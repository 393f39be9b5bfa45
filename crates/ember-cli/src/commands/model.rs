//! /model command - list and switch models

use ember_ai::ModelInfo;
use ember_ai::models;

use super::CommandResult;

pub struct ModelCommand;

impl ModelCommand {
    /// List models with no args, otherwise switch to the best match.
    ///
    /// Ids the registry does not know are accepted as-is for the current
    /// provider, since a bridge may serve any model.
    pub fn execute(args: &str, current: &ModelInfo) -> CommandResult {
        if args.is_empty() {
            return CommandResult::Message(list_models(current));
        }
        CommandResult::ChangeModel(find_model(args, &current.provider))
    }
}

fn list_models(current: &ModelInfo) -> String {
    let registered = models::get_models(&current.provider);
    let mut output = format!("Current model: {} ({})\n", current.id, current.provider);
    if registered.is_empty() {
        output.push_str("\nNo registered models for this provider; any id is accepted.");
    } else {
        output.push_str(&format!("\n{}:\n", current.provider));
        for model in &registered {
            let marker = if model.id == current.id { " *" } else { "" };
            output.push_str(&format!(
                "  {} ({}k tokens){}\n",
                model.id,
                model.ceiling() / 1000,
                marker
            ));
        }
    }
    output.push_str("\nSwitch with: /model <name>");
    output
}

fn find_model(query: &str, provider: &str) -> ModelInfo {
    let query_lower = query.to_lowercase();

    // Exact match first
    if let Some(model) = models::get_model_by_id(query) {
        return models::resolve(provider, &model.id);
    }

    // Partial match, preferring the current provider
    let matches = models::search(&query_lower);
    let preferred = matches
        .iter()
        .find(|m| m.provider.eq_ignore_ascii_case(provider))
        .or_else(|| matches.first());
    match preferred {
        Some(model) => models::resolve(provider, &model.id),
        None => ModelInfo::custom(provider, query),
    }
}
