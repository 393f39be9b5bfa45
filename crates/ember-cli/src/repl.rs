//! Line-oriented front end: prompt loop, event rendering, permission prompts.

use std::io::{self, IsTerminal, Write};

use ember_agent::{
    Agent, AgentEvent, AgentHandle, PermissionDecision, PermissionRequest, TurnOutcome,
};
use ember_ai::Message;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::commands::{self, CommandResult};
use crate::config::Config;
use crate::utils::{budget_passes_str, compaction_reason_str, truncate_chars};

pub type InputLines = Lines<BufReader<Stdin>>;

pub fn input_lines() -> InputLines {
    BufReader::new(tokio::io::stdin()).lines()
}

/// Print agent events until the agent goes away.
pub fn spawn_printer(mut receiver: broadcast::Receiver<AgentEvent>) -> JoinHandle<()> {
    let is_tty = io::stdout().is_terminal();
    tokio::spawn(async move {
        let mut context = (0u32, 0u32);
        loop {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                AgentEvent::MessageAppended {
                    message: Message::Assistant { content, .. },
                } if !content.is_empty() => {
                    println!("{}", content);
                }
                AgentEvent::ToolExecutionStart { tool_name, .. } => {
                    print!("[{}...", tool_name);
                    io::stdout().flush().ok();
                }
                AgentEvent::ToolExecutionEnd {
                    result, is_error, ..
                } => {
                    let first_line = result.lines().next().unwrap_or("");
                    if is_error {
                        println!(" error]");
                        println!("  {}", truncate_chars(&result, 120).replace('\n', " "));
                    } else if result.chars().count() <= 60 && !result.contains('\n') {
                        println!(" {}]", result);
                    } else {
                        println!(" {}]", truncate_chars(first_line, 50));
                    }
                }
                AgentEvent::PermissionDenied { tool_name } => {
                    println!("[{} denied]", tool_name);
                }
                AgentEvent::BudgetApplied {
                    tokens_before,
                    tokens_after,
                    passes,
                } => {
                    println!(
                        "[Context reduced ({}): ~{} -> ~{} tokens]",
                        budget_passes_str(&passes),
                        tokens_before,
                        tokens_after
                    );
                }
                AgentEvent::CompactionStart { reason } => {
                    println!("[Compacting context ({})]", compaction_reason_str(reason));
                }
                AgentEvent::CompactionEnd {
                    tokens_before,
                    tokens_after,
                    summarized,
                } => {
                    if summarized {
                        println!("[Compacted: ~{} -> ~{} tokens]", tokens_before, tokens_after);
                    } else {
                        println!("[Compaction failed; kept ~{} tokens]", tokens_after);
                    }
                }
                AgentEvent::UsageUpdated {
                    estimated_tokens,
                    ceiling,
                    ..
                } => {
                    context = (estimated_tokens, ceiling);
                }
                AgentEvent::HistoryRestored { messages } => {
                    println!("[Restored {} messages from backup]", messages);
                }
                AgentEvent::DepthLimitReached { depth } => {
                    println!("[Stopped after {} tool rounds; send another message to continue]", depth);
                }
                AgentEvent::Cancelled => {
                    println!("[Cancelled]");
                }
                AgentEvent::Error { message } => {
                    eprintln!("Error: {}", message);
                }
                AgentEvent::TurnEnd { usage } => {
                    if is_tty {
                        println!(
                            "[{} in, {} out | context ~{}/{}]",
                            usage.input, usage.output, context.0, context.1
                        );
                    }
                }
                _ => {}
            }
        }
    })
}

/// Run one turn, answering permission requests on stdin and turning Ctrl-C into cancellation.
pub async fn drive_turn(
    agent: &mut Agent,
    input: &str,
    lines: &mut InputLines,
) -> ember_agent::Result<TurnOutcome> {
    let gate = agent.gate().clone();
    let handle = agent.handle();
    let mut requests = gate.subscribe();

    let turn = agent.prompt(input);
    tokio::pin!(turn);

    loop {
        tokio::select! {
            result = &mut turn => return result,
            request = requests.recv() => {
                if let Ok(request) = request {
                    let decision = ask_permission(&request, lines, &handle).await;
                    gate.resolve(decision);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n[Cancelling...]");
                handle.abort();
            }
        }
    }
}

async fn ask_permission(
    request: &PermissionRequest,
    lines: &mut InputLines,
    handle: &AgentHandle,
) -> PermissionDecision {
    eprintln!();
    eprintln!("{} wants to run:", request.tool_name);
    eprintln!("{}", describe_request(request));
    eprint!("Allow? [y]es / [n]o / [a]lways this session: ");
    io::stderr().flush().ok();

    tokio::select! {
        line = lines.next_line() => parse_decision(line.ok().flatten().as_deref()),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[Cancelling...]");
            handle.abort();
            PermissionDecision::Deny
        }
    }
}

fn parse_decision(answer: Option<&str>) -> PermissionDecision {
    match answer.map(|a| a.trim().to_lowercase()).as_deref() {
        Some("y" | "yes") => PermissionDecision::ApproveOnce,
        Some("a" | "always") => PermissionDecision::ApproveForSession,
        _ => PermissionDecision::Deny,
    }
}

/// A short, human-readable view of the arguments being approved.
fn describe_request(request: &PermissionRequest) -> String {
    let args = &request.arguments;
    let field = |name: &str| args.get(name).and_then(|v| v.as_str());
    match request.tool_name.as_str() {
        "run_command" => {
            let command = field("command").unwrap_or("");
            match field("cwd") {
                Some(cwd) => format!("  $ {}  (in {})", command, cwd),
                None => format!("  $ {}", command),
            }
        }
        "write_file" => format!(
            "  {} ({} bytes)",
            field("path").unwrap_or(""),
            field("content").map(str::len).unwrap_or(0)
        ),
        "send_input" => format!(
            "  {} <- {:?}",
            field("process_id").unwrap_or(""),
            field("input").unwrap_or("")
        ),
        "stop_process" => format!("  {}", field("process_id").unwrap_or("")),
        _ => format!("  {}", truncate_chars(&args.to_string(), 200)),
    }
}

/// Non-interactive mode: one prompt, then exit.
pub async fn run_command(agent: &mut Agent, command: &str) -> anyhow::Result<()> {
    let printer = spawn_printer(agent.subscribe());
    let mut lines = input_lines();

    let result = drive_turn(agent, command, &mut lines).await;

    // Wait a bit for final events
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    printer.abort();

    result?;
    Ok(())
}

pub async fn run_interactive(agent: &mut Agent, config: &Config) -> anyhow::Result<()> {
    let printer = spawn_printer(agent.subscribe());
    let mut lines = input_lines();

    if io::stderr().is_terminal() {
        let model = &agent.config().model;
        eprintln!("ember ({} via {})  /help for commands", model.id, agent.provider_name());
        eprintln!();
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        // EOF or Ctrl-C at the prompt
        let Some(line) = line else { break };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let providers = config.provider_names();
        if let Some(result) = commands::execute_command(input, &agent.config().model, &providers) {
            if apply_command(agent, config, result).await {
                break;
            }
            println!();
            continue;
        }

        match drive_turn(agent, input, &mut lines).await {
            Ok(TurnOutcome::Completed) => {}
            Ok(outcome) => tracing::debug!(?outcome, "Turn ended early"),
            // Already rendered from the error event
            Err(e) => tracing::debug!("Turn failed: {}", e),
        }

        // Wait for events to finish
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        println!();
    }

    printer.abort();
    Ok(())
}

/// Apply an operator command. Returns `true` when the session should end.
async fn apply_command(agent: &mut Agent, config: &Config, result: CommandResult) -> bool {
    match result {
        CommandResult::Clear => {
            agent.clear_history();
            println!("Cleared conversation.");
        }
        CommandResult::Restore => match agent.restore_backup() {
            Some(count) => println!("Restored {} messages from backup.", count),
            None => println!("No backup to restore."),
        },
        CommandResult::Compact => match agent.compact().await {
            Ok(result) => println!(
                "Context compacted: ~{} -> ~{} tokens, {} messages remaining.",
                result.tokens_before,
                result.tokens_after,
                agent.messages().len()
            ),
            Err(e) => println!("Compaction failed: {}", e),
        },
        CommandResult::ChangeModel(model) => {
            let model = config.limits.apply(model);
            println!("Switched to: {} ({}k tokens)", model.id, model.ceiling() / 1000);
            agent.set_model(model);
        }
        CommandResult::ChangeProvider(name) => match config.bridge(&name) {
            Ok(provider) => {
                let model = config.model_for(&name, None);
                println!("Switched to provider {} with model {}", name, model.id);
                agent.set_provider(std::sync::Arc::new(provider), model);
            }
            Err(e) => println!("{}", e),
        },
        CommandResult::Message(msg) => println!("{}", msg),
        CommandResult::Exit => return true,
        CommandResult::Unknown(cmd) => {
            println!("Unknown command: /{}", cmd);
            println!("Type /help for available commands.");
        }
    }
    false
}
