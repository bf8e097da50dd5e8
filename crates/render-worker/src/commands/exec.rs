// `exec { cmd }`: runs an arbitrary command line through the ProcessInvoker,
// plus the process plumbing shared with the Blender command.

use super::{CommandContext, CommandHandler, CommandOutcome, Settings};
use async_trait::async_trait;
use render_sdk::{
    OutputLine, OutputStream, ProcessCancelledError, ProcessExitCodeError, ProcessInvoker,
    ProcessSpec,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct ExecCommand {
    invoker: Arc<ProcessInvoker>,
}

impl ExecCommand {
    pub fn new(invoker: Arc<ProcessInvoker>) -> Self {
        Self { invoker }
    }
}

/// `cmd` is either one command line or an array of arguments.
fn process_spec(settings: &Settings) -> Result<ProcessSpec, String> {
    match settings.get("cmd") {
        None | Some(Value::Null) => Err("missing setting \"cmd\"".to_string()),
        Some(Value::String(line)) => ProcessSpec::from_command_line(line)
            .ok_or_else(|| "setting \"cmd\" must not be empty".to_string()),
        Some(Value::Array(items)) => {
            let args = items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<String>>();
            let (program, rest) = args
                .split_first()
                .ok_or_else(|| "setting \"cmd\" must not be empty".to_string())?;
            Ok(ProcessSpec::new(program.clone()).args(rest.iter().cloned()))
        }
        Some(_) => Err("setting \"cmd\" must be a string or an array of strings".to_string()),
    }
}

#[async_trait]
impl CommandHandler for ExecCommand {
    async fn execute(&self, settings: &Settings, context: &CommandContext) -> CommandOutcome {
        let spec = match process_spec(settings) {
            Ok(spec) => spec,
            Err(reason) => return CommandOutcome::failed(reason),
        };
        let spec = spec.current_dir(context.work_directory());
        run_process(&self.invoker, &spec, context, |_| {}).await
    }
}

/// Run `spec`, forwarding every output line to the task log and to
/// `on_line`, and map the result onto a command outcome.
pub(crate) async fn run_process<F>(
    invoker: &ProcessInvoker,
    spec: &ProcessSpec,
    context: &CommandContext,
    mut on_line: F,
) -> CommandOutcome
where
    F: FnMut(&OutputLine) + Send,
{
    context.log(format!("Running: {}", spec.display()));

    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let run = invoker.execute(spec, true, context.cancel_token().clone(), tx);
    let forward = async {
        while let Some(line) = rx.recv().await {
            match line.stream {
                OutputStream::Stdout => context.log(line.data.as_str()),
                OutputStream::Stderr => context.log(format!("stderr: {}", line.data)),
            }
            on_line(&line);
        }
    };

    let (result, ()) = tokio::join!(run, forward);
    match result {
        Ok(_) => CommandOutcome::success_with(format!("{} finished", spec.program)),
        Err(e) if e.downcast_ref::<ProcessCancelledError>().is_some() => CommandOutcome::Canceled,
        Err(e) => match e.downcast_ref::<ProcessExitCodeError>() {
            Some(exit) => CommandOutcome::failed(format!(
                "{} exited with code {}",
                exit.program, exit.exit_code
            )),
            None => CommandOutcome::failed(format!("{e:#}")),
        },
    }
}
