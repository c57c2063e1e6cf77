//! Line-oriented debug console.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sonde_dap::model::VariableNode;
use sonde_dap::{DebugCommand, DebugSession, DebugSessionManager, ExpressionItem};
use url::Url;

pub const HELP: &str = "commands: continue, next, step-in, step-out, pause, threads, stack, \
scopes, break <file>:<line>, eval <expr>, help, quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Continue,
    Next,
    StepIn,
    StepOut,
    Pause,
    Threads,
    Stack,
    Scopes,
    Break { file: PathBuf, line: i64 },
    Eval(String),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let command = match word {
            "continue" | "c" => ConsoleCommand::Continue,
            "next" | "n" => ConsoleCommand::Next,
            "step-in" | "s" => ConsoleCommand::StepIn,
            "step-out" => ConsoleCommand::StepOut,
            "pause" => ConsoleCommand::Pause,
            "threads" => ConsoleCommand::Threads,
            "stack" | "bt" => ConsoleCommand::Stack,
            "scopes" => ConsoleCommand::Scopes,
            "break" | "b" => {
                let (file, line) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| "usage: break <file>:<line>".to_string())?;
                let line = line
                    .parse::<i64>()
                    .ok()
                    .filter(|l| *l > 0)
                    .ok_or_else(|| format!("invalid line number '{line}'"))?;
                if file.is_empty() {
                    return Err("usage: break <file>:<line>".into());
                }
                ConsoleCommand::Break {
                    file: PathBuf::from(file),
                    line,
                }
            }
            "eval" | "p" => {
                if rest.is_empty() {
                    return Err("usage: eval <expr>".into());
                }
                ConsoleCommand::Eval(rest.to_string())
            }
            "help" | "?" => ConsoleCommand::Help,
            "quit" | "q" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command '{other}' (try 'help')")),
        };
        Ok(Some(command))
    }
}

/// Runs console commands against a session manager.
pub struct Console {
    manager: DebugSessionManager,
}

impl Console {
    pub fn new(manager: DebugSessionManager) -> Self {
        Self { manager }
    }

    /// Run `command` and return the lines to print.
    pub async fn run(&self, command: &ConsoleCommand) -> Vec<String> {
        match command {
            ConsoleCommand::Continue => self.debug_command(DebugCommand::ResumeThread).await,
            ConsoleCommand::Next => self.debug_command(DebugCommand::StepOver).await,
            ConsoleCommand::StepIn => self.debug_command(DebugCommand::StepInto).await,
            ConsoleCommand::StepOut => self.debug_command(DebugCommand::StepOut).await,
            ConsoleCommand::Pause => self.pause().await,
            ConsoleCommand::Threads => self.threads(),
            ConsoleCommand::Stack => self.stack(),
            ConsoleCommand::Scopes => self.scopes().await,
            ConsoleCommand::Break { file, line } => self.toggle_breakpoint(file, *line),
            ConsoleCommand::Eval(expression) => self.eval(expression).await,
            ConsoleCommand::Help => vec![HELP.to_string()],
            ConsoleCommand::Quit => Vec::new(),
        }
    }

    async fn debug_command(&self, command: DebugCommand) -> Vec<String> {
        if command.execute(&self.manager).await {
            Vec::new()
        } else {
            vec![format!("{command}: not available")]
        }
    }

    /// Pause the running threads of every live session. A session whose
    /// threads all run is never current, so this cannot go through the
    /// current thread.
    async fn pause(&self) -> Vec<String> {
        let running: Vec<Arc<DebugSession>> = self
            .manager
            .sessions()
            .into_iter()
            .filter(|s| !s.running_threads().is_empty())
            .collect();
        if running.is_empty() {
            return vec![format!("{}: not available", DebugCommand::SuspendThread)];
        }
        for session in running {
            session.pause_all().await;
        }
        Vec::new()
    }

    fn session(&self) -> Option<Arc<DebugSession>> {
        self.manager.current_session()
    }

    fn threads(&self) -> Vec<String> {
        let Some(session) = self.session() else {
            return vec!["no debug session".to_string()];
        };
        let current = session.current_thread().map(|t| t.id());
        session
            .threads()
            .iter()
            .map(|thread| {
                let marker = if Some(thread.id()) == current { '*' } else { ' ' };
                let status = match thread.stopped_details() {
                    Some(details) => {
                        let reason = details
                            .event
                            .description
                            .clone()
                            .unwrap_or_else(|| format!("{:?}", details.event.reason).to_lowercase());
                        format!("stopped: {reason}")
                    }
                    None => "running".to_string(),
                };
                format!("{marker} {} {} ({status})", thread.id(), thread.name())
            })
            .collect()
    }

    fn stack(&self) -> Vec<String> {
        let Some(thread) = self.manager.current_thread() else {
            return vec!["no current thread".to_string()];
        };
        if let Some(message) = thread
            .stopped_details()
            .and_then(|d| d.frames_error_message)
        {
            return vec![message];
        }
        let current = thread.current_frame().map(|f| f.id());
        thread
            .frames()
            .iter()
            .map(|frame| {
                let marker = if Some(frame.id()) == current { '*' } else { ' ' };
                let location = frame
                    .source()
                    .map(|s| format!("{}:{}", s.name(), frame.line()))
                    .unwrap_or_else(|| format!("line {}", frame.line()));
                format!("{marker} #{} {} at {location}", frame.id(), frame.name())
            })
            .collect()
    }

    async fn scopes(&self) -> Vec<String> {
        let Some(frame) = self.manager.current_frame() else {
            return vec!["no current frame".to_string()];
        };
        let mut lines = Vec::new();
        for scope in frame.scopes().await {
            lines.push(format!("{}:", scope.name()));
            if scope.is_expensive() {
                lines.push("  (expensive, not expanded)".to_string());
                continue;
            }
            for node in scope.container.children().await {
                lines.push(format!("  {}", describe(&node)));
            }
        }
        lines
    }

    fn toggle_breakpoint(&self, file: &Path, line: i64) -> Vec<String> {
        let path = if file.is_absolute() {
            file.to_path_buf()
        } else {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(file),
                Err(e) => return vec![format!("cannot resolve {}: {e}", file.display())],
            }
        };
        let Ok(uri) = Url::from_file_path(&path) else {
            return vec![format!("not a file path: {}", path.display())];
        };
        let store = self.manager.store();
        store.toggle(&uri, line, None);
        let verb = if store.get(&uri, line).is_some() {
            "set"
        } else {
            "removed"
        };
        vec![format!("breakpoint {verb} at {}:{line}", path.display())]
    }

    async fn eval(&self, expression: &str) -> Vec<String> {
        let item = ExpressionItem::new(expression);
        let session = self.session();
        item.evaluate(session.as_deref(), "repl").await;
        let mut lines = vec![item.value()];
        for node in item.children().await {
            lines.push(format!("  {}", describe(&node)));
        }
        lines
    }
}

fn describe(node: &VariableNode) -> String {
    match node {
        VariableNode::Variable(variable) => format!("{} = {}", variable.name(), variable.value()),
        VariableNode::Range(range) => range.name.clone(),
        VariableNode::Error(message) => format!("<{message}>"),
    }
}
