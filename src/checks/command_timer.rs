// Command timer check
//
// Runs one or more commands and reports how long each took, in
// milliseconds, as a `double` metric named after the command.

use async_trait::async_trait;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Instant;
use tokio::process::Command;
use tracing::debug;

use super::{Check, CheckError, CheckReport};
use crate::maas::{Metric, MetricType};

/// A metric name paired with the argv to time
#[derive(Debug, Clone, PartialEq)]
pub struct TimedCommand {
    pub name: String,
    pub argv: Vec<String>,
}

impl FromStr for TimedCommand {
    type Err = CheckError;

    /// Parses `NAME=COMMAND`, splitting COMMAND with shell quoting rules
    ///
    /// Only the first `=` separates the name, so commands may contain `=`.
    /// The name becomes a metric name and must be a single word.
    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let invalid = || CheckError::InvalidCommand(arg.to_string());

        let (name, command) = arg.split_once('=').ok_or_else(invalid)?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(invalid());
        }
        let argv = shlex::split(command).ok_or_else(invalid)?;
        if argv.is_empty() {
            return Err(invalid());
        }

        Ok(TimedCommand {
            name: name.to_string(),
            argv,
        })
    }
}

/// Times a list of commands, run one after another
pub struct CommandTimerCheck {
    commands: Vec<TimedCommand>,
}

impl CommandTimerCheck {
    /// Builds the check; a repeated name keeps its first position and last command
    pub fn new(commands: Vec<TimedCommand>) -> Self {
        let mut unique: Vec<TimedCommand> = Vec::with_capacity(commands.len());
        for command in commands {
            match unique.iter_mut().find(|c| c.name == command.name) {
                Some(existing) => *existing = command,
                None => unique.push(command),
            }
        }
        CommandTimerCheck { commands: unique }
    }

    /// Runs one command with output discarded and returns elapsed milliseconds
    async fn time_command(command: &TimedCommand) -> Result<f64, CheckError> {
        let failed = |reason: String| CheckError::CommandFailed {
            name: command.name.clone(),
            reason,
        };

        let start = Instant::now();
        let status = Command::new(&command.argv[0])
            .args(&command.argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let elapsed = start.elapsed();

        if !status.success() {
            return Err(failed(status.to_string()));
        }

        let millis = elapsed.as_secs_f64() * 1000.0;
        debug!("Command '{}' took {:.3}ms", command.name, millis);
        Ok(millis)
    }
}

#[async_trait]
impl Check for CommandTimerCheck {
    fn name(&self) -> &str {
        "command_timer"
    }

    async fn run(&self) -> Result<CheckReport, CheckError> {
        let mut report = CheckReport::new();
        for command in &self.commands {
            let millis = Self::time_command(command).await?;
            report.push(
                Metric::new(&command.name, MetricType::Double, format!("{:.3}", millis))
                    .with_unit("milliseconds"),
            );
        }
        Ok(report)
    }
}
