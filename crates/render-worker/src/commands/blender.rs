// `blender_render`: renders frames of a .blend file with Blender in
// background mode, turning its `Fra:` progress lines into task activity.

use super::exec::run_process;
use super::{optional_str, required_str, CommandContext, CommandHandler, CommandOutcome, Settings};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use render_sdk::{OutputStream, ProcessInvoker, ProcessSpec};
use serde_json::Value;
use std::sync::Arc;

/// Matches Blender's per-frame status line, e.g.
/// `Fra:1 Mem:136.00M (0.00M, Peak 136.00M) | Time:00:00.62 | Rendering 1 / 8 samples`.
static FRAME_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Fra:(?P<frame>\d+)\s*(?P<rest>.*)$").expect("Invalid frame line regex")
});

pub struct BlenderRenderCommand {
    invoker: Arc<ProcessInvoker>,
}

impl BlenderRenderCommand {
    pub fn new(invoker: Arc<ProcessInvoker>) -> Self {
        Self { invoker }
    }
}

/// Blender wants frame ranges as `1..10`; jobs describe them as `1-10`.
fn frame_range(frames: &str) -> String {
    frames
        .split(',')
        .map(|part| {
            let part = part.trim();
            match part.split_once('-') {
                Some((start, end)) if !start.is_empty() => format!("{}..{}", start.trim(), end.trim()),
                _ => part.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn cycles_samples(settings: &Settings) -> Result<Option<u64>, String> {
    match settings.get("cycles_samples") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| "setting \"cycles_samples\" must be a positive integer".to_string()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| "setting \"cycles_samples\" must be a positive integer".to_string()),
        Some(_) => Err("setting \"cycles_samples\" must be a positive integer".to_string()),
    }
}

/// Build the Blender invocation from the command settings.
fn blender_spec(settings: &Settings) -> Result<ProcessSpec, String> {
    let blender_cmd = required_str(settings, "blender_cmd")?;
    let filepath = required_str(settings, "filepath")?;

    let spec = ProcessSpec::from_command_line(blender_cmd)
        .ok_or_else(|| "setting \"blender_cmd\" must not be empty".to_string())?;
    let mut spec = spec
        .args(["--enable-autoexec", "-noaudio", "--background"])
        .arg(filepath);

    if let Some(output) = optional_str(settings, "render_output")? {
        spec = spec.arg("--render-output").arg(output);
    }
    if let Some(format) = optional_str(settings, "format")? {
        spec = spec.arg("--render-format").arg(format);
    }
    if let Some(samples) = cycles_samples(settings)? {
        spec = spec
            .arg("--python-expr")
            .arg(format!("import bpy; bpy.context.scene.cycles.samples = {samples}"));
    }

    let frames = match settings.get("frames") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(frame_range(s)),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(_) => return Err("setting \"frames\" must be a string".to_string()),
    };
    if let Some(frames) = frames {
        spec = spec.arg("--render-frame").arg(frames);
    }

    Ok(spec)
}

#[async_trait]
impl CommandHandler for BlenderRenderCommand {
    async fn execute(&self, settings: &Settings, context: &CommandContext) -> CommandOutcome {
        let spec = match blender_spec(settings) {
            Ok(spec) => spec.current_dir(context.work_directory()),
            Err(reason) => return CommandOutcome::failed(reason),
        };

        context.activity("Starting Blender");
        run_process(&self.invoker, &spec, context, |line| {
            if line.stream != OutputStream::Stdout {
                return;
            }
            if let Some(caps) = FRAME_LINE.captures(&line.data) {
                context.activity(format!("Blender frame {}: {}", &caps["frame"], &caps["rest"]));
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandEvent;
    use render_sdk::trace::NullTraceWriter;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn settings(value: Value) -> Settings {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_frame_range() {
        assert_eq!(frame_range("1-10"), "1..10");
        assert_eq!(frame_range("1-3, 7,9-12"), "1..3,7,9..12");
        assert_eq!(frame_range("5"), "5");
    }

    #[test]
    fn test_command_line() {
        let spec = blender_spec(&settings(json!({
            "blender_cmd": "/opt/blender/blender --factory-startup",
            "filepath": "/shared/shot_010.blend",
            "frames": "1-4",
            "render_output": "/render/shot_010/######",
            "format": "PNG",
            "cycles_samples": 64
        })))
        .unwrap();

        assert_eq!(spec.program, "/opt/blender/blender");
        assert_eq!(
            spec.args,
            vec![
                "--factory-startup",
                "--enable-autoexec",
                "-noaudio",
                "--background",
                "/shared/shot_010.blend",
                "--render-output",
                "/render/shot_010/######",
                "--render-format",
                "PNG",
                "--python-expr",
                "import bpy; bpy.context.scene.cycles.samples = 64",
                "--render-frame",
                "1..4",
            ]
        );
    }

    #[test]
    fn test_missing_filepath() {
        let err = blender_spec(&settings(json!({"blender_cmd": "blender"}))).unwrap_err();
        assert_eq!(err, "missing setting \"filepath\"");
    }

    #[test]
    fn test_bad_samples() {
        let err = blender_spec(&settings(json!({
            "blender_cmd": "blender",
            "filepath": "x.blend",
            "cycles_samples": "lots"
        })))
        .unwrap_err();
        assert!(err.contains("cycles_samples"));
    }

    #[test]
    fn test_frame_line() {
        let caps = FRAME_LINE
            .captures("Fra:12 Mem:136.00M | Time:00:01.20 | Rendering 4 / 8 samples")
            .unwrap();
        assert_eq!(&caps["frame"], "12");
        assert!(caps["rest"].starts_with("Mem:136.00M"));
        assert!(FRAME_LINE.captures("Saved: /render/0012.png").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_progress_becomes_activity() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let context = CommandContext::new(CancellationToken::new(), tx, dir.path());
        let command =
            BlenderRenderCommand::new(Arc::new(ProcessInvoker::new(Arc::new(NullTraceWriter))));

        // A stand-in for Blender that prints one progress line.
        let outcome = command
            .execute(
                &settings(json!({
                    "blender_cmd": "sh -c 'echo Fra:3 Mem:1M' sh",
                    "filepath": "scene.blend"
                })),
                &context,
            )
            .await;
        assert!(outcome.is_success());

        let mut activities = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let CommandEvent::Activity(text) = event {
                activities.push(text);
            }
        }
        assert!(activities.contains(&"Blender frame 3: Mem:1M".to_string()));
    }
}
