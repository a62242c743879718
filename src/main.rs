use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lease_queue::cli;
use lease_queue::error::HandlerError;
use lease_queue::handler::{Handler, KillReason, undefined_decision};
use lease_queue::monitor::MonitoredTask;
use lease_queue::router::Router;
use lease_queue::task::AcquiredTask;
use serde_json::{Map, Value};
use tracing::info;

/// Logs the payload. An optional `sleep` field (seconds) simulates work
/// that stops early when the task is killed. An optional `decision` field
/// names a decision to take, with `options` as its arguments.
struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn run(&self, task: &MonitoredTask) -> Result<(), HandlerError> {
        info!(task = %task.key(), data = %serde_json::Value::Object(task.data().clone()), "echo");

        if let Some(decision) = task.data().get("decision").and_then(|v| v.as_str()) {
            let options = match task.data().get("options") {
                Some(Value::Object(options)) => options.clone(),
                _ => Map::new(),
            };
            self.decide(task, decision, &options).await?;
        }

        let seconds = task.data().get("sleep").and_then(|v| v.as_f64()).unwrap_or(0.0);
        if seconds > 0.0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
                reason = task.killed() => {
                    return Err(HandlerError::Aborted(reason.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn decide(
        &self,
        task: &MonitoredTask,
        decision: &str,
        options: &Map<String, Value>,
    ) -> Result<(), HandlerError> {
        match decision {
            "log" => {
                info!(task = %task.key(), options = %serde_json::Value::Object(options.clone()), "decision taken");
                Ok(())
            }
            _ => Err(undefined_decision(decision, options)),
        }
    }

    fn kill(&self, reason: &KillReason) -> Result<(), HandlerError> {
        info!(%reason, "echo task asked to stop");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = cli::parse(&args).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("{}", cli::USAGE);
        std::process::exit(2);
    });

    let router = Arc::new(Router::new().route("echo", |_: &AcquiredTask| Echo));

    let code = match cli::execute(cli, router).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}
