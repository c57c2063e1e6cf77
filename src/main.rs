mod console;
mod logging;

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use sonde_config::{load_config, load_file, Config, DefaultPaths, LaunchConfig, PlatformPaths};
use sonde_dap::protocol::{Event, ExitedEventBody, StoppedEventBody};
use sonde_dap::{
    AdapterCommand, BreakpointStore, DebugConfiguration, DebugSessionManager,
    ProcessTerminalLauncher, SessionOptions, StdioAdapterProvider,
};

use crate::console::{Console, ConsoleCommand, HELP};

/// Command-line arguments.
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    configuration: Option<String>,
}

impl Args {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self> {
        let mut parsed = Args::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if arg == "--config" || arg == "-c" {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            } else if arg.starts_with('-') {
                bail!("unknown option '{arg}'");
            } else if parsed.configuration.is_some() {
                bail!("unexpected argument '{arg}'");
            } else {
                parsed.configuration = Some(arg);
            }
        }
        Ok(parsed)
    }
}

fn adapter_commands(config: &Config) -> HashMap<String, AdapterCommand> {
    config
        .adapters
        .iter()
        .map(|(debug_type, adapter)| {
            let mut command = AdapterCommand::new(adapter.command.clone())
                .with_args(adapter.args.iter().cloned());
            command.cwd = adapter.cwd.clone();
            command.env = adapter.env.clone();
            (debug_type.clone(), command)
        })
        .collect()
}

fn session_options(config: &Config) -> SessionOptions {
    SessionOptions {
        thread_refresh_delay: Duration::from_millis(config.session.thread_refresh_delay_ms),
        stack_refresh_delay: Duration::from_millis(config.session.stack_refresh_delay_ms),
        client_id: config.session.client_id.clone(),
        client_name: config.session.client_name.clone(),
        locale: config.session.locale.clone(),
    }
}

fn debug_configuration(launch: &LaunchConfig) -> Result<DebugConfiguration> {
    let fields = serde_json::to_value(&launch.fields)
        .with_context(|| format!("configuration '{}' is not representable as JSON", launch.name))?;
    let mut configuration =
        DebugConfiguration::new(&launch.debug_type, &launch.name, &launch.request);
    if let serde_json::Value::Object(fields) = fields {
        configuration.fields = fields;
    }
    Ok(configuration)
}

fn exit_message(event: &Event) -> Option<String> {
    let body = event.parse_body::<ExitedEventBody>().ok()?;
    Some(format!("process exited with code {}", body.exit_code))
}

/// Pick the named configuration, or the only one when no name is given.
fn select_configuration<'a>(config: &'a Config, name: Option<&str>) -> Result<&'a LaunchConfig> {
    match name {
        Some(name) => config
            .configuration(name)
            .with_context(|| format!("no configuration named '{name}'")),
        None => match config.configurations.as_slice() {
            [only] => Ok(only),
            [] => bail!("no debug configurations defined"),
            _ => bail!("several configurations defined, pass one by name"),
        },
    }
}

async fn run(args: Args) -> Result<()> {
    let paths = DefaultPaths::new().context("failed to detect platform paths")?;
    let project_dir = env::current_dir().ok();
    let config = match &args.config {
        Some(path) => load_file(path),
        None => load_config(&paths.config_dir(), project_dir.as_deref()),
    }
    .context("failed to load configuration")?;

    let log_path = logging::init(&config.log, &paths)?;
    info!("sonde starting, logging to {}", log_path.display());

    let launch = select_configuration(&config, args.configuration.as_deref())?;
    let configuration = debug_configuration(launch)?;

    let provider = Arc::new(StdioAdapterProvider::new(adapter_commands(&config)));
    let manager = DebugSessionManager::new(
        provider,
        Arc::new(BreakpointStore::new()),
        Some(Arc::new(ProcessTerminalLauncher)),
        session_options(&config),
    );

    let _created = manager.on_did_create_session(|session| {
        println!("session {} started ({})", session.id(), session.configuration().name);
        session
            .on_output(|output| {
                if output.category.as_deref() != Some("telemetry") {
                    print!("{}", output.output);
                }
            })
            .detach();
        session
            .on_event("stopped", |event| {
                if let Ok(body) = event.parse_body::<StoppedEventBody>() {
                    let thread = body.thread_id.map_or("all".to_string(), |id| id.to_string());
                    let reason = body
                        .description
                        .unwrap_or_else(|| format!("{:?}", body.reason).to_lowercase());
                    println!("thread {thread} stopped: {reason}");
                }
            })
            .detach();
        session
            .on_event("exited", |event| {
                if let Some(message) = exit_message(event) {
                    println!("{message}");
                }
            })
            .detach();
    });
    let _active = manager.on_did_change_active_session(|(_, current)| {
        if let Some(session) = current {
            println!("current session: {}", session.id());
        }
    });
    let _destroyed = manager.on_did_destroy_session(|session| {
        println!("session {} ended", session.id());
    });
    let _notifications = manager.on_notification(|notification| {
        println!("[{}] {}", notification.session_id, notification.message);
    });

    manager
        .create(configuration)
        .await
        .context("failed to start debug session")?;

    let console = Console::new(manager.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");
    while let Some(line) = lines.next_line().await? {
        match ConsoleCommand::parse(&line) {
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(command)) => {
                for output in console.run(&command).await {
                    println!("{output}");
                }
            }
            Ok(None) => {}
            Err(message) => println!("{message}"),
        }
        if manager.sessions().is_empty() {
            break;
        }
    }

    manager.destroy(None).await;
    info!("sonde exiting");
    Ok(())
}

#[tokio::main]
async fn main() {
    let result = match Args::parse(env::args().skip(1)) {
        Ok(args) => run(args).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("sonde: {:#}", e);
        std::process::exit(1);
    }
}
