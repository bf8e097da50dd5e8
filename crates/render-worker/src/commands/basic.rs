// `echo` and `sleep`: the simplest commands, used by test jobs and to pace
// render jobs.

use super::{required_number, required_str, CommandContext, CommandHandler, CommandOutcome, Settings};
use async_trait::async_trait;
use std::time::Duration;

/// `echo { message }`: logs the message and reports it as output.
pub struct EchoCommand;

#[async_trait]
impl CommandHandler for EchoCommand {
    async fn execute(&self, settings: &Settings, context: &CommandContext) -> CommandOutcome {
        let message = match required_str(settings, "message") {
            Ok(message) => message,
            Err(reason) => return CommandOutcome::failed(reason),
        };
        context.log(message);
        CommandOutcome::success_with(message)
    }
}

/// `sleep { time_in_seconds }`: waits, giving up as soon as the task is
/// cancelled.
pub struct SleepCommand;

#[async_trait]
impl CommandHandler for SleepCommand {
    async fn execute(&self, settings: &Settings, context: &CommandContext) -> CommandOutcome {
        let seconds = match required_number(settings, "time_in_seconds") {
            Ok(seconds) => seconds,
            Err(reason) => return CommandOutcome::failed(reason),
        };
        let Ok(duration) = Duration::try_from_secs_f64(seconds) else {
            return CommandOutcome::failed("setting \"time_in_seconds\" is out of range");
        };

        context.log(format!("Sleeping {seconds} seconds"));
        tokio::select! {
            _ = tokio::time::sleep(duration) => {
                CommandOutcome::success_with(format!("slept {seconds} seconds"))
            }
            _ = context.cancel_token().cancelled() => {
                context.log("Sleep interrupted by cancellation");
                CommandOutcome::Canceled
            }
        }
    }
}
