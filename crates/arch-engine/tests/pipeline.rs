use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arch_config::{ArchConfig, ModelBackend, SlotPolicy};
use arch_engine::{
    BackgroundRemovalModel, MeshDecoderModel, ModelLifecycle, ModelRegistry, Orchestrator,
    ReconstructionModel, RelayEvent, RelayReceiver, RequestTicket, SessionKey, StepCallback,
    TextToImageModel,
};
use arch_types::{
    ArchError, GaussianCloud, GaussianPoint, GenerateImageRequest, LoadState, MeshTarget,
    ModelError, Payload, Reconstruction, RenderedImage, Residency, SamplingRequest,
    StructuredLatent, TexturedAsset,
};

/// Shared stand-in for device memory.
#[derive(Default)]
struct Device {
    resident: AtomicUsize,
    peak: AtomicUsize,
    loads: Mutex<Vec<String>>,
}

impl Device {
    fn loads(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }
}

struct FakeModel {
    name: String,
    device: Arc<Device>,
    gate: Option<Receiver<()>>,
    load_delay: Duration,
    fail_run: bool,
    loaded: bool,
}

impl FakeModel {
    fn new(name: &str, device: &Arc<Device>) -> Self {
        Self {
            name: name.to_string(),
            device: device.clone(),
            gate: None,
            load_delay: Duration::ZERO,
            fail_run: false,
            loaded: false,
        }
    }

    /// Block every run until the returned sender fires.
    fn gated(mut self) -> (Self, Sender<()>) {
        let (tx, rx) = channel();
        self.gate = Some(rx);
        (self, tx)
    }

    fn slow_loading(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    fn failing(mut self) -> Self {
        self.fail_run = true;
        self
    }

    fn run(&mut self, on_step: StepCallback<'_>) -> Result<(), ModelError> {
        assert!(self.loaded, "{} ran while unloaded", self.name);
        on_step(1);
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        on_step(2);
        if self.fail_run {
            return Err(ModelError::new("CUDA out of memory"));
        }
        Ok(())
    }
}

impl ModelLifecycle for FakeModel {
    fn load(&mut self) -> Result<(), ModelError> {
        std::thread::sleep(self.load_delay);
        let now = self.device.resident.fetch_add(1, Ordering::SeqCst) + 1;
        self.device.peak.fetch_max(now, Ordering::SeqCst);
        self.device.loads.lock().unwrap().push(self.name.clone());
        self.loaded = true;
        Ok(())
    }

    fn unload(&mut self) {
        if self.loaded {
            self.device.resident.fetch_sub(1, Ordering::SeqCst);
        }
        self.loaded = false;
    }

    fn total_steps(&self) -> u32 {
        2
    }
}

impl TextToImageModel for FakeModel {
    fn generate(&mut self, request: &SamplingRequest, on_step: StepCallback<'_>) -> Result<RenderedImage, ModelError> {
        self.run(on_step)?;
        Ok(RenderedImage::png(request.prompt.as_bytes().to_vec()))
    }
}

impl BackgroundRemovalModel for FakeModel {
    fn remove_background(&mut self, image: &[u8], on_step: StepCallback<'_>) -> Result<RenderedImage, ModelError> {
        self.run(on_step)?;
        Ok(RenderedImage::png(image.to_vec()))
    }
}

impl ReconstructionModel for FakeModel {
    fn reconstruct(&mut self, image: &[u8], on_step: StepCallback<'_>) -> Result<Reconstruction, ModelError> {
        self.run(on_step)?;
        let points = image
            .iter()
            .map(|&b| GaussianPoint {
                position: [b as f32, 0.0, 0.0],
                color_dc: [0.0; 3],
                opacity: 1.0,
                scale: [0.0; 3],
                rotation: [1.0, 0.0, 0.0, 0.0],
            })
            .collect();
        Ok(Reconstruction {
            gaussians: GaussianCloud { points },
            latent: StructuredLatent {
                resolution: 64,
                channels: 1,
                coords: vec![[image.len() as u32, 0, 0]],
                features: vec![0.5],
            },
        })
    }
}

impl MeshDecoderModel for FakeModel {
    fn decode(
        &mut self,
        latent: &StructuredLatent,
        gaussians: &GaussianCloud,
        _target: &MeshTarget,
        on_step: StepCallback<'_>,
    ) -> Result<TexturedAsset, ModelError> {
        self.run(on_step)?;
        // Echo what was decoded so tests can check provenance.
        let glb = format!("{}:{}", latent.coords[0][0], gaussians.len()).into_bytes();
        Ok(TexturedAsset { glb })
    }
}

fn config(policy: SlotPolicy) -> ArchConfig {
    let mut config = ArchConfig::default();
    config.slot_policy = policy;
    for spec in &mut config.models {
        spec.backend = ModelBackend::Mock { step_delay_ms: 0 };
    }
    config
}

fn prompt(model: &str, text: &str) -> GenerateImageRequest {
    GenerateImageRequest {
        prompt: Some(text.to_string()),
        image_model: Some(model.to_string()),
        ..Default::default()
    }
}

async fn collect(mut rx: RelayReceiver) -> (Vec<u8>, Result<Payload, ArchError>) {
    let mut percents = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            RelayEvent::Progress(p) => percents.push(p.percent),
            RelayEvent::Finished(outcome) => {
                assert!(rx.recv().await.is_none(), "event after terminal outcome");
                return (percents, outcome);
            }
        }
    }
    panic!("relay closed without a terminal outcome");
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_second_model_waits_for_first_release() {
    let device = Arc::new(Device::default());
    let (a, release_a) = FakeModel::new("a", &device).gated();
    let mut registry = ModelRegistry::new();
    registry.add_text_to_image("a", Residency::Exclusive, Box::new(a));
    registry.add_text_to_image("b", Residency::Exclusive, Box::new(FakeModel::new("b", &device)));
    let orch = Orchestrator::new(config(SlotPolicy::Serialize), registry).unwrap();

    let first = orch.generate_image(RequestTicket::new(), prompt("a", "chest"));
    settle().await;
    let second = orch.generate_image(RequestTicket::new(), prompt("b", "lamp"));
    settle().await;

    assert_eq!(device.loads(), vec!["a"], "b must not load while a holds the slot");
    assert_eq!(orch.slots().occupant_name().as_deref(), Some("a"));

    release_a.send(()).unwrap();
    let (p1, r1) = collect(first).await;
    let (p2, r2) = collect(second).await;

    assert_eq!(p1, vec![50, 100]);
    assert_eq!(p2, vec![50, 100]);
    assert_eq!(r1.unwrap().bytes, b"chest");
    assert_eq!(r2.unwrap().bytes, b"lamp");
    assert_eq!(device.loads(), vec!["a", "b"]);
    assert_eq!(device.peak.load(Ordering::SeqCst), 1);
    assert_eq!(orch.slots().occupant_name().as_deref(), Some("b"));
}

#[tokio::test]
async fn test_fail_fast_policy_reports_busy_slot() {
    let device = Arc::new(Device::default());
    let (a, release_a) = FakeModel::new("a", &device).gated();
    let mut registry = ModelRegistry::new();
    registry.add_text_to_image("a", Residency::Exclusive, Box::new(a));
    registry.add_text_to_image("b", Residency::Exclusive, Box::new(FakeModel::new("b", &device)));
    let orch = Orchestrator::new(config(SlotPolicy::FailFast), registry).unwrap();

    let first = orch.generate_image(RequestTicket::new(), prompt("a", "chest"));
    settle().await;
    let (_, busy) = collect(orch.generate_image(RequestTicket::new(), prompt("b", "lamp"))).await;
    match busy {
        Err(ArchError::SlotBusy { requested, occupant }) => {
            assert_eq!(requested, "b");
            assert_eq!(occupant, "a");
        }
        other => panic!("expected SlotBusy, got {other:?}"),
    }

    release_a.send(()).unwrap();
    assert!(collect(first).await.1.is_ok());
    assert_eq!(device.loads(), vec!["a"]);
}

#[tokio::test]
async fn test_reconstruction_then_decode_uses_those_artifacts() {
    let device = Arc::new(Device::default());
    let mut registry = ModelRegistry::new();
    registry.add_reconstruction("recon", Residency::Exclusive, Box::new(FakeModel::new("recon", &device)));
    registry.add_mesh_decoder("decoder", Residency::Exclusive, Box::new(FakeModel::new("decoder", &device)));
    let orch = Orchestrator::new(config(SlotPolicy::Serialize), registry).unwrap();
    let session = SessionKey::global();

    let (_, ply) = collect(orch.reconstruct(RequestTicket::new(), vec![1, 2, 3], session.clone())).await;
    let ply = ply.unwrap();
    assert!(String::from_utf8_lossy(&ply.bytes).contains("element vertex 3\n"));

    let cached = orch.cache().read(&session).unwrap();
    assert_eq!(cached.gaussians.len(), 3);

    let (_, glb) = collect(orch.decode_mesh(RequestTicket::new(), session.clone())).await;
    let glb = glb.unwrap();
    assert_eq!(glb.bytes, b"3:3");
    assert_eq!(glb.content_type, "model/gltf-binary");

    // A newer reconstruction replaces the entry.
    collect(orch.reconstruct(RequestTicket::new(), vec![9; 5], session.clone()))
        .await
        .1
        .unwrap();
    let (_, glb) = collect(orch.decode_mesh(RequestTicket::new(), session)).await;
    assert_eq!(glb.unwrap().bytes, b"5:5");
    assert_eq!(device.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sessions_do_not_share_cache() {
    let device = Arc::new(Device::default());
    let mut registry = ModelRegistry::new();
    registry.add_reconstruction("recon", Residency::Exclusive, Box::new(FakeModel::new("recon", &device)));
    registry.add_mesh_decoder("decoder", Residency::Exclusive, Box::new(FakeModel::new("decoder", &device)));
    let orch = Orchestrator::new(config(SlotPolicy::Serialize), registry).unwrap();

    let alice = SessionKey::from_client(Some("alice"));
    let bob = SessionKey::from_client(Some("bob"));
    collect(orch.reconstruct(RequestTicket::new(), vec![1], alice.clone()))
        .await
        .1
        .unwrap();

    let (percents, result) = collect(orch.decode_mesh(RequestTicket::new(), bob)).await;
    assert!(percents.is_empty());
    assert_eq!(result, Err(ArchError::CacheEmpty));
    assert!(collect(orch.decode_mesh(RequestTicket::new(), alice)).await.1.is_ok());
}

#[tokio::test]
async fn test_abandoned_request_discards_result_and_frees_slot() {
    let device = Arc::new(Device::default());
    let (recon, release) = FakeModel::new("recon", &device).gated();
    let mut registry = ModelRegistry::new();
    registry.add_reconstruction("recon", Residency::Exclusive, Box::new(recon));
    registry.add_text_to_image("t2i", Residency::Exclusive, Box::new(FakeModel::new("t2i", &device)));
    let orch = Orchestrator::new(config(SlotPolicy::Serialize), registry).unwrap();

    let ticket = RequestTicket::new();
    let rx = orch.reconstruct(ticket.clone(), vec![1, 2], SessionKey::global());
    settle().await;

    // Client goes away mid-inference.
    ticket.abandon();
    drop(rx);
    release.send(()).unwrap();

    // The slot is released by the detached stage, so the next model loads.
    let (_, next) = collect(orch.generate_image(RequestTicket::new(), prompt("t2i", "vase"))).await;
    assert_eq!(next.unwrap().bytes, b"vase");
    assert!(orch.cache().read(&SessionKey::global()).is_none());
    assert_eq!(device.loads(), vec!["recon", "t2i"]);
}

#[tokio::test]
async fn test_failed_run_evicts_model() {
    let device = Arc::new(Device::default());
    let mut registry = ModelRegistry::new();
    registry.add_text_to_image("a", Residency::Exclusive, Box::new(FakeModel::new("a", &device).failing()));
    let orch = Orchestrator::new(config(SlotPolicy::Serialize), registry).unwrap();

    let (_, result) = collect(orch.generate_image(RequestTicket::new(), prompt("a", "chest"))).await;
    let err = result.unwrap_err();
    assert!(matches!(err, ArchError::ModelRun { .. }));
    assert!(!err.client_message().contains("CUDA"));

    assert_eq!(orch.slots().occupant_name(), None);
    assert!(orch.status().slots.iter().all(|s| s.state == LoadState::Unloaded));
    assert_eq!(device.resident.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resident_cutter_skips_the_slot() {
    let device = Arc::new(Device::default());
    let mut registry = ModelRegistry::new();
    registry.add_text_to_image("t2i", Residency::Exclusive, Box::new(FakeModel::new("t2i", &device)));
    registry.add_background("cutter", Residency::AlwaysResident, Box::new(FakeModel::new("cutter", &device)));
    let orch = Orchestrator::new(config(SlotPolicy::Serialize), registry).unwrap();
    orch.warm_up().await;

    let (percents, result) = collect(orch.remove_background(RequestTicket::new(), vec![7, 7])).await;
    assert_eq!(percents, vec![50, 100]);
    assert_eq!(result.unwrap().bytes, vec![7, 7]);
    assert_eq!(orch.slots().occupant_name(), None);

    let (_, empty) = collect(orch.remove_background(RequestTicket::new(), Vec::new())).await;
    assert_eq!(empty, Err(ArchError::invalid_input("No image provided.")));
}

#[tokio::test]
async fn test_concurrent_first_requests_load_resident_model_once() {
    let device = Arc::new(Device::default());
    let cutter = FakeModel::new("cutter", &device).slow_loading(Duration::from_millis(200));
    let mut registry = ModelRegistry::new();
    registry.add_background("cutter", Residency::AlwaysResident, Box::new(cutter));
    let orch = Orchestrator::new(config(SlotPolicy::Serialize), registry).unwrap();

    let first = orch.remove_background(RequestTicket::new(), vec![1]);
    let second = orch.remove_background(RequestTicket::new(), vec![2]);
    let ((_, r1), (_, r2)) = tokio::join!(collect(first), collect(second));

    assert_eq!(r1.unwrap().bytes, vec![1]);
    assert_eq!(r2.unwrap().bytes, vec![2]);
    assert_eq!(device.loads(), vec!["cutter"]);
    assert_eq!(device.resident.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_request_abandoned_while_queued_leaves_occupant_loaded() {
    let device = Arc::new(Device::default());
    let (a, release_a) = FakeModel::new("a", &device).gated();
    let mut registry = ModelRegistry::new();
    registry.add_text_to_image("a", Residency::Exclusive, Box::new(a));
    registry.add_text_to_image("b", Residency::Exclusive, Box::new(FakeModel::new("b", &device)));
    let orch = Orchestrator::new(config(SlotPolicy::Serialize), registry).unwrap();

    let first = orch.generate_image(RequestTicket::new(), prompt("a", "chest"));
    settle().await;
    let queued = RequestTicket::new();
    let second = orch.generate_image(queued.clone(), prompt("b", "lamp"));
    settle().await;

    // Client of the queued request goes away before the slot frees up.
    queued.abandon();
    drop(second);
    release_a.send(()).unwrap();
    assert_eq!(collect(first).await.1.unwrap().bytes, b"chest");
    settle().await;

    assert_eq!(device.loads(), vec!["a"]);
    assert_eq!(orch.slots().occupant_name().as_deref(), Some("a"));
    assert!(!orch.slots().is_held());
}

#[tokio::test]
async fn test_failed_run_unloads_resident_model() {
    let device = Arc::new(Device::default());
    let cutter = FakeModel::new("cutter", &device).failing();
    let mut registry = ModelRegistry::new();
    registry.add_background("cutter", Residency::AlwaysResident, Box::new(cutter));
    let orch = Orchestrator::new(config(SlotPolicy::Serialize), registry).unwrap();
    orch.warm_up().await;

    let (_, result) = collect(orch.remove_background(RequestTicket::new(), vec![3])).await;
    assert!(matches!(result, Err(ArchError::ModelRun { .. })));
    assert!(orch.status().slots.iter().all(|s| s.state == LoadState::Unloaded));
    assert_eq!(device.resident.load(Ordering::SeqCst), 0);
}
