//! /provider command - list and switch bridge providers

use super::CommandResult;

pub struct ProviderCommand;

impl ProviderCommand {
    pub fn execute(args: &str, current: &str, providers: &[String]) -> CommandResult {
        if args.is_empty() {
            return CommandResult::Message(list_providers(current, providers));
        }
        match providers.iter().find(|p| p.eq_ignore_ascii_case(args)) {
            Some(name) => CommandResult::ChangeProvider(name.clone()),
            None => CommandResult::Message(format!(
                "No provider named '{}' in the config\nUse /provider to list configured providers",
                args
            )),
        }
    }
}

fn list_providers(current: &str, providers: &[String]) -> String {
    if providers.is_empty() {
        return "No providers configured. Add a [providers.<name>] table to the config file."
            .to_string();
    }
    let mut output = String::from("Configured providers:\n");
    for name in providers {
        let marker = if name == current { " *" } else { "" };
        output.push_str(&format!("  {}{}\n", name, marker));
    }
    output.push_str("\nSwitch with: /provider <name>");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers() -> Vec<String> {
        vec!["local".to_string(), "remote".to_string()]
    }

    #[test]
    fn test_switch() {
        assert_eq!(
            ProviderCommand::execute("Remote", "local", &providers()),
            CommandResult::ChangeProvider("remote".to_string())
        );
    }

    #[test]
    fn test_unknown_provider() {
        let CommandResult::Message(text) = ProviderCommand::execute("cloud", "local", &providers())
        else {
            panic!("expected a message");
        };
        assert!(text.starts_with("No provider named 'cloud'"));
    }

    #[test]
    fn test_list_marks_current() {
        let CommandResult::Message(text) = ProviderCommand::execute("", "local", &providers())
        else {
            panic!("expected a listing");
        };
        assert!(text.contains("  local *\n"));
        assert!(text.contains("  remote\n"));
    }
}
