//! Slash commands for interactive mode

mod model;
mod provider;

pub use model::ModelCommand;
pub use provider::ProviderCommand;

use ember_ai::ModelInfo;

/// Result of executing a slash command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Clear the conversation
    Clear,
    /// Put back the conversation saved before the last compaction
    Restore,
    /// Summarize the conversation now
    Compact,
    /// Change the model
    ChangeModel(ModelInfo),
    /// Change the provider
    ChangeProvider(String),
    /// Show a message to the user (not sent to agent)
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse and execute a slash command
pub fn execute_command(
    input: &str,
    current_model: &ModelInfo,
    providers: &[String],
) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next().unwrap_or_default().to_lowercase();
    let args = parts.next().map(str::trim).unwrap_or("");

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),

        "clear" | "c" => CommandResult::Clear,

        "restore" | "r" => CommandResult::Restore,

        "compact" => CommandResult::Compact,

        "quit" | "exit" | "q" => CommandResult::Exit,

        "model" | "m" => ModelCommand::execute(args, current_model),

        "provider" | "p" => ProviderCommand::execute(args, &current_model.provider, providers),

        _ => CommandResult::Unknown(command),
    })
}

pub fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?          Show this help message
  /model, /m [name]      List models or switch to a model
  /provider, /p [name]   List configured providers or switch to one
  /compact               Summarize the conversation now
  /restore, /r           Restore the conversation saved before the last compaction
  /clear, /c             Clear conversation history
  /quit, /exit, /q       Exit ember

Press Ctrl-C during a turn to cancel it."#
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelInfo {
        ModelInfo::custom("local", "qwen2.5-coder:14b")
    }

    #[test]
    fn test_not_a_command() {
        assert_eq!(execute_command("hello", &model(), &[]), None);
    }

    #[test]
    fn test_basic_commands() {
        let m = model();
        assert_eq!(execute_command("/clear", &m, &[]), Some(CommandResult::Clear));
        assert_eq!(execute_command(" /restore ", &m, &[]), Some(CommandResult::Restore));
        assert_eq!(execute_command("/EXIT", &m, &[]), Some(CommandResult::Exit));
        assert_eq!(execute_command("/compact", &m, &[]), Some(CommandResult::Compact));
        assert!(matches!(
            execute_command("/help", &m, &[]),
            Some(CommandResult::Message(text)) if text.contains("/restore")
        ));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            execute_command("/teleport now", &model(), &[]),
            Some(CommandResult::Unknown("teleport".to_string()))
        );
    }
}
