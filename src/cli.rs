//! Command line for the `lease-queue` binary.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::client::{Client, FinishOptions, SubmitOptions};
use crate::config::{Compression, EngineConfig};
use crate::error::{ConfigError, TaskError};
use crate::logging;
use crate::processor::{self, child};
use crate::router::Router;
use crate::supervisor::{ConfigLoader, Supervisor};

pub const USAGE: &str = "\
Usage: lease-queue [--config FILE] <command> [args]

Commands:
  run                          run the supervisor and its worker pool
  worker                       worker child entry (started by `run`)
  init [--force]               create the task table
  submit KEY TYPE [JSON]       submit a task
      [--resource R] [--max-running N] [--run-at EPOCH] [--gzip]
  list                         list visible tasks
  show KEY                     print one task as JSON
  cancel KEY                   request cancellation of a running task
  force-finish KEY             finish a task regardless of its state

Config: --config FILE or LEASEQ_CONFIG, then LEASEQ_* overrides.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run,
    Worker,
    Init {
        force: bool,
    },
    Submit {
        key: String,
        task_type: String,
        data: Map<String, Value>,
        options: SubmitArgs,
    },
    List,
    Show {
        key: String,
    },
    Cancel {
        key: String,
    },
    ForceFinish {
        key: String,
    },
    Help,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitArgs {
    pub resource: Option<String>,
    pub max_running: Option<i64>,
    pub run_at: Option<i64>,
    pub gzip: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub config: Option<PathBuf>,
    pub command: Command,
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| invalid(flag, "missing value"))
}

fn number(raw: &str, flag: &str) -> Result<i64, ConfigError> {
    raw.parse()
        .map_err(|_| invalid(flag, format!("not an integer: {raw}")))
}

/// Parse arguments, without the program name.
pub fn parse(args: &[String]) -> Result<Cli, ConfigError> {
    let mut config = None;
    let mut positional: Vec<&str> = Vec::new();
    let mut submit = SubmitArgs::default();
    let mut force = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                config = Some(PathBuf::from(value(args, i, "--config")?));
                i += 2;
            }
            "--resource" => {
                submit.resource = Some(value(args, i, "--resource")?.to_string());
                i += 2;
            }
            "--max-running" => {
                submit.max_running = Some(number(value(args, i, "--max-running")?, "--max-running")?);
                i += 2;
            }
            "--run-at" => {
                submit.run_at = Some(number(value(args, i, "--run-at")?, "--run-at")?);
                i += 2;
            }
            "--gzip" => {
                submit.gzip = true;
                i += 1;
            }
            "--force" => {
                force = true;
                i += 1;
            }
            "--help" | "-h" => {
                positional.insert(0, "help");
                i += 1;
            }
            other if other.starts_with("--") => {
                return Err(invalid(other, "unknown option"));
            }
            other => {
                positional.push(other);
                i += 1;
            }
        }
    }

    let key_arg = |name: &str| -> Result<String, ConfigError> {
        positional
            .get(1)
            .map(|s| s.to_string())
            .ok_or_else(|| invalid(name, "KEY is required"))
    };

    let command = match positional.first().copied() {
        None | Some("help") => Command::Help,
        Some("run") => Command::Run,
        Some("worker") => Command::Worker,
        Some("init") => Command::Init { force },
        Some("list") => Command::List,
        Some("show") => Command::Show { key: key_arg("show")? },
        Some("cancel") => Command::Cancel { key: key_arg("cancel")? },
        Some("force-finish") => Command::ForceFinish {
            key: key_arg("force-finish")?,
        },
        Some("submit") => {
            let key = key_arg("submit")?;
            let task_type = positional
                .get(2)
                .map(|s| s.to_string())
                .ok_or_else(|| invalid("submit", "TYPE is required"))?;
            let data = match positional.get(3) {
                Some(raw) => match serde_json::from_str(raw) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => return Err(invalid("submit", "JSON payload must be an object")),
                    Err(e) => return Err(invalid("submit", format!("invalid JSON payload: {e}"))),
                },
                None => Map::new(),
            };
            Command::Submit {
                key,
                task_type,
                data,
                options: submit,
            }
        }
        Some(other) => return Err(invalid("command", format!("unknown command: {other}"))),
    };

    Ok(Cli { config, command })
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config
        .clone()
        .or_else(|| std::env::var("LEASEQ_CONFIG").ok().map(PathBuf::from))
}

/// Run a parsed command. Returns the process exit status.
pub async fn execute(cli: Cli, router: Arc<Router>) -> anyhow::Result<i32> {
    let path = config_path(&cli);

    match cli.command {
        Command::Help => {
            eprintln!("{USAGE}");
            Ok(0)
        }
        Command::Run => {
            let config = EngineConfig::load(path.as_deref())?;
            let log = logging::init(config.log.as_deref())?;

            eprintln!("lease-queue v{}", env!("CARGO_PKG_VERSION"));
            eprintln!("   Database: {}", config.client.database);
            eprintln!("   Table: {}", config.client.table);
            eprintln!(
                "   Processors: {} ({:?})",
                config.processors, config.processor_type
            );
            if let Some(file) = &config.log {
                eprintln!("   Log: {}", file.display());
            }

            let loader: ConfigLoader = Box::new(move || EngineConfig::load(path.as_deref()));
            let supervisor = Arc::new(
                Supervisor::new(loader, processor::default_factory(router)).with_log(log),
            );
            supervisor.run().await?;
            Ok(0)
        }
        Command::Worker => {
            let config = child::config_from_env()?;
            let _log = logging::init(config.log.as_deref())?;
            child::run(config, router).await?;
            Ok(0)
        }
        command => {
            let config = EngineConfig::load(path.as_deref())?;
            let _log = logging::init(None)?;
            let client = Client::open(&config.client).await?;
            admin(&client, command).await
        }
    }
}

async fn admin(client: &Client, command: Command) -> anyhow::Result<i32> {
    match command {
        Command::Init { force } => {
            client.init_database(force).await?;
            eprintln!("Initialized table {}", client.config().table);
        }
        Command::Submit {
            key,
            task_type,
            data,
            options,
        } => {
            let submitted = client
                .submit(
                    &key,
                    &task_type,
                    data,
                    SubmitOptions {
                        run_at: options.run_at,
                        resource: options.resource,
                        max_running: options.max_running,
                        compression: options.gzip.then_some(Compression::Gzip),
                        ..Default::default()
                    },
                )
                .await;
            match submitted {
                Ok(_) => eprintln!("Submitted {key}"),
                Err(e) if matches!(e.task_error(), Some(TaskError::AlreadyExists { .. })) => {
                    eprintln!("Task {key} already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::List => {
            println!(
                "{:<32} {:<16} {:<16} {:>12} {:<16}",
                "key", "type", "status", "timeout", "resource"
            );
            for task in client.list(None).await? {
                let meta = task.attributes();
                println!(
                    "{:<32} {:<16} {:<16} {:>12} {:<16}",
                    meta.key,
                    meta.task_type,
                    meta.status.as_str(),
                    meta.timeout,
                    meta.resource.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Show { key } => {
            let meta = client.get_task_metadata(&key, None).await?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Cancel { key } => {
            client.cancel_request(&key, None).await?;
            eprintln!("Cancel requested for {key}");
        }
        Command::ForceFinish { key } => {
            client.force_finish(&key, FinishOptions::default()).await?;
            eprintln!("Finished {key}");
        }
        Command::Run | Command::Worker | Command::Help => {}
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_submit_with_options() {
        let cli = parse(&args(&[
            "--config",
            "q.json",
            "submit",
            "mail.1",
            "mail",
            r#"{"to":"a@b"}"#,
            "--resource",
            "smtp",
            "--max-running",
            "2",
            "--gzip",
        ]))
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("q.json")));
        let Command::Submit {
            key,
            task_type,
            data,
            options,
        } = cli.command
        else {
            panic!("expected submit");
        };
        assert_eq!(key, "mail.1");
        assert_eq!(task_type, "mail");
        assert_eq!(data["to"], Value::from("a@b"));
        assert_eq!(options.resource.as_deref(), Some("smtp"));
        assert_eq!(options.max_running, Some(2));
        assert!(options.gzip);
    }

    #[test]
    fn empty_args_show_help() {
        assert_eq!(parse(&[]).unwrap().command, Command::Help);
    }

    #[test]
    fn key_commands_require_key() {
        assert!(parse(&args(&["cancel"])).is_err());
        assert_eq!(
            parse(&args(&["force-finish", "k"])).unwrap().command,
            Command::ForceFinish { key: "k".into() }
        );
    }

    #[test]
    fn rejects_non_object_payload() {
        assert!(parse(&args(&["submit", "k", "t", "[1,2]"])).is_err());
    }

    #[test]
    fn rejects_unknown_command_and_option() {
        assert!(parse(&args(&["explode"])).is_err());
        assert!(parse(&args(&["list", "--verbose"])).is_err());
        assert!(parse(&args(&["submit", "k", "t", "--max-running", "many"])).is_err());
    }

    #[test]
    fn init_force_flag() {
        assert_eq!(
            parse(&args(&["init", "--force"])).unwrap().command,
            Command::Init { force: true }
        );
    }
}
