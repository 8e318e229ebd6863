use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use arch_types::{
    GaussianCloud, MeshTarget, ModelError, Reconstruction, RenderedImage, SamplingRequest,
    StructuredLatent, TexturedAsset,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, info, warn};

use super::ipc_types::{WorkerCommand, WorkerPayload, WorkerRequest, WorkerResponse};
use crate::capability::{
    BackgroundRemovalModel, MeshDecoderModel, ModelLifecycle, ReconstructionModel, StepCallback,
    TextToImageModel,
};

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A model hosted by an external worker executable.
///
/// The same type implements every capability; which one is used depends on
/// the slot it is registered under.
pub struct ProcessModel {
    name: String,
    command: Vec<String>,
    default_steps: u32,
    total_steps: u32,
    next_id: u64,
    worker: Option<Worker>,
}

impl ProcessModel {
    pub fn new(name: &str, command: Vec<String>, default_steps: u32) -> Self {
        Self {
            name: name.to_string(),
            command,
            default_steps,
            total_steps: default_steps,
            next_id: 1,
            worker: None,
        }
    }

    fn spawn(&self) -> Result<Worker, ModelError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ModelError::new("empty worker command"))?;

        info!("[PROCESS] Spawning worker for '{}': {}", self.name, self.command.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Worker logs go to parent's stderr
            .spawn()
            .map_err(|e| ModelError::new(format!("Failed to spawn worker: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok(Worker {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            }),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                Err(ModelError::new("worker pipes unavailable"))
            }
        }
    }

    fn send(&mut self, command: WorkerCommand) -> Result<u64, ModelError> {
        let id = self.next_id;
        self.next_id += 1;
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| ModelError::new(format!("model '{}' not initialised", self.name)))?;

        let mut line = serde_json::to_string(&WorkerRequest { id, command })
            .map_err(|e| ModelError::new(format!("Failed to encode command: {e}")))?;
        line.push('\n');
        worker.stdin.write_all(line.as_bytes())?;
        worker.stdin.flush()?;
        Ok(id)
    }

    /// Read responses for `id` until a terminal payload, forwarding steps.
    fn receive(&mut self, id: u64, on_step: StepCallback<'_>) -> Result<WorkerPayload, ModelError> {
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| ModelError::new(format!("model '{}' not initialised", self.name)))?;

        let mut line = String::new();
        loop {
            line.clear();
            if worker.stdout.read_line(&mut line)? == 0 {
                return Err(ModelError::new("worker process exited unexpectedly"));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let response: WorkerResponse = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    warn!("[PROCESS] Ignoring malformed worker line: {e}");
                    continue;
                }
            };
            if response.id != id && response.id != 0 {
                debug!("[PROCESS] Dropping stale response #{}", response.id);
                continue;
            }
            match response.payload {
                WorkerPayload::Step { step } => on_step(step),
                WorkerPayload::Error { message } => return Err(ModelError::new(message)),
                terminal => return Ok(terminal),
            }
        }
    }

    fn call(&mut self, command: WorkerCommand, on_step: StepCallback<'_>) -> Result<WorkerPayload, ModelError> {
        let id = self.send(command)?;
        self.receive(id, on_step)
    }

    /// Kill the worker process immediately. OS reclaims all memory.
    fn kill(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            let shutdown = serde_json::to_string(&WorkerRequest {
                id: 0,
                command: WorkerCommand::Shutdown,
            });
            if let Ok(line) = shutdown {
                let _ = writeln!(worker.stdin, "{line}");
            }
            info!("[PROCESS] Killing worker for '{}'", self.name);
            let _ = worker.child.kill();
            let _ = worker.child.wait(); // Reap
        }
    }
}

fn unexpected(payload: &WorkerPayload) -> ModelError {
    ModelError::new(format!("unexpected worker response: {payload:?}"))
}

fn decode_b64(data: &str) -> Result<Vec<u8>, ModelError> {
    STANDARD
        .decode(data)
        .map_err(|e| ModelError::new(format!("invalid base64 from worker: {e}")))
}

impl ModelLifecycle for ProcessModel {
    fn load(&mut self) -> Result<(), ModelError> {
        if self.worker.is_none() {
            self.worker = Some(self.spawn()?);
        }
        let payload = self.call(
            WorkerCommand::Load {
                model: self.name.clone(),
            },
            &mut |_| {},
        )?;
        match payload {
            WorkerPayload::Loaded { total_steps } => {
                self.total_steps = total_steps.unwrap_or(self.default_steps).max(1);
                Ok(())
            }
            other => Err(unexpected(&other)),
        }
    }

    fn unload(&mut self) {
        self.kill();
        self.total_steps = self.default_steps;
    }

    fn total_steps(&self) -> u32 {
        self.total_steps
    }
}

impl TextToImageModel for ProcessModel {
    fn generate(
        &mut self,
        request: &SamplingRequest,
        on_step: StepCallback<'_>,
    ) -> Result<RenderedImage, ModelError> {
        let command = WorkerCommand::Generate {
            prompt: request.prompt.clone(),
            seed: request.seed,
            steps: request.steps,
            width: request.width,
            height: request.height,
            guidance_scale: request.guidance_scale,
        };
        match self.call(command, on_step)? {
            WorkerPayload::Image { data, mime } => Ok(RenderedImage {
                bytes: decode_b64(&data)?,
                mime,
            }),
            other => Err(unexpected(&other)),
        }
    }
}

impl BackgroundRemovalModel for ProcessModel {
    fn remove_background(
        &mut self,
        image: &[u8],
        on_step: StepCallback<'_>,
    ) -> Result<RenderedImage, ModelError> {
        let command = WorkerCommand::RemoveBackground {
            image: STANDARD.encode(image),
        };
        match self.call(command, on_step)? {
            WorkerPayload::Image { data, mime } => Ok(RenderedImage {
                bytes: decode_b64(&data)?,
                mime,
            }),
            other => Err(unexpected(&other)),
        }
    }
}

impl ReconstructionModel for ProcessModel {
    fn reconstruct(
        &mut self,
        image: &[u8],
        on_step: StepCallback<'_>,
    ) -> Result<Reconstruction, ModelError> {
        let command = WorkerCommand::Reconstruct {
            image: STANDARD.encode(image),
        };
        match self.call(command, on_step)? {
            WorkerPayload::Reconstruction { gaussians, latent } => Ok(Reconstruction {
                gaussians: GaussianCloud::from_packed_f32(&decode_b64(&gaussians)?)?,
                latent,
            }),
            other => Err(unexpected(&other)),
        }
    }
}

impl MeshDecoderModel for ProcessModel {
    fn decode(
        &mut self,
        latent: &StructuredLatent,
        gaussians: &GaussianCloud,
        target: &MeshTarget,
        on_step: StepCallback<'_>,
    ) -> Result<TexturedAsset, ModelError> {
        let command = WorkerCommand::Decode {
            latent: latent.clone(),
            gaussians: STANDARD.encode(gaussians.to_packed_f32()),
            simplify: target.simplify,
            texture_size: target.texture_size,
        };
        match self.call(command, on_step)? {
            WorkerPayload::Asset { glb } => Ok(TexturedAsset {
                glb: decode_b64(&glb)?,
            }),
            other => Err(unexpected(&other)),
        }
    }
}

impl Drop for ProcessModel {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Tiny shell worker: answers Load, Generate and Reconstruct.
    const SCRIPT: &str = r#"
while read line; do
  case "$line" in
    *'"Load"'*) echo '{"id":0,"payload":{"type":"Loaded","total_steps":3}}' ;;
    *'"Generate"'*)
      echo '{"id":0,"payload":{"type":"Step","step":1}}'
      echo 'not json'
      echo '{"id":0,"payload":{"type":"Step","step":2}}'
      echo '{"id":0,"payload":{"type":"Image","data":"aGVsbG8=","mime":"image/png"}}' ;;
    *'"Reconstruct"'*) echo '{"id":0,"payload":{"type":"Error","message":"out of memory"}}' ;;
    *'"Shutdown"'*) exit 0 ;;
  esac
done
"#;

    fn script_model() -> ProcessModel {
        ProcessModel::new(
            "scripted",
            vec!["sh".to_string(), "-c".to_string(), SCRIPT.to_string()],
            20,
        )
    }

    #[test]
    fn test_generate_through_worker() {
        let mut model = script_model();
        model.load().unwrap();
        assert_eq!(model.total_steps(), 3);

        let request = SamplingRequest {
            prompt: "chest".to_string(),
            seed: 42,
            steps: 3,
            width: 8,
            height: 8,
            guidance_scale: 5.0,
        };
        let mut steps = Vec::new();
        let image = model.generate(&request, &mut |s| steps.push(s)).unwrap();
        assert_eq!(steps, vec![1, 2]);
        assert_eq!(image.bytes, b"hello");

        model.unload();
        assert_eq!(model.total_steps(), 20);
        assert!(model.generate(&request, &mut |_| {}).is_err());
    }

    #[test]
    fn test_worker_error_is_reported() {
        let mut model = script_model();
        model.load().unwrap();
        let err = model.reconstruct(b"img", &mut |_| {}).unwrap_err();
        assert_eq!(err.0, "out of memory");
    }

    #[test]
    fn test_missing_executable_fails_load() {
        let mut model = ProcessModel::new("ghost", vec!["/nonexistent/worker-bin".to_string()], 1);
        assert!(model.load().is_err());
    }
}
