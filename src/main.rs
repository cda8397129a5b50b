//! Fence Ring Frame Loop
//!
//! Drives the submission core against the headless device:
//! 1. Loads configuration (first argument, defaults otherwise)
//! 2. Creates the device, render context and executor
//! 3. Records every pass concurrently, one thread per recorder
//! 4. Submits the lists in a fixed order behind a single fence signal
//! 5. Flushes the GPU and tears the context down on exit or Ctrl+C

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Context as _, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fence_ring::device::{PipelineStateId, RootSignatureId};
use fence_ring::{
    ClearPassRecorder, CommandListExecutor, CommandListRecorder, CompletionMode, Config,
    FrameInputs, GeometryPassRecorder, HeadlessDevice, MeshData, RenderContext,
    SharedCommandList,
};

const QUAD_INDICES: [u32; 6] = [0, 1, 2, 2, 1, 3];

/// Frame loop state
struct RenderService {
    config: Config,
    device: Option<Arc<HeadlessDevice>>,
    context: Option<Arc<RenderContext>>,
    executor: Option<CommandListExecutor>,
    recorders: Vec<Box<dyn CommandListRecorder>>,
    shutdown: Arc<AtomicBool>,
    frames_rendered: u64,
}

impl RenderService {
    fn new(config: Config) -> Self {
        Self {
            config,
            device: None,
            context: None,
            executor: None,
            recorders: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            frames_rendered: 0,
        }
    }

    /// Create the headless device, the render context and the executor
    fn init_device(&mut self) -> Result<()> {
        let mode = self.config.completion_mode()?;
        if mode == CompletionMode::Manual {
            bail!("manual completion mode needs an external driver and cannot run the frame loop");
        }
        info!("Initializing headless device ({:?})...", mode);
        let device = Arc::new(HeadlessDevice::new(mode)?);

        let context = RenderContext::new(device.clone(), &self.config)?;
        let executor = CommandListExecutor::new(context.clone())?;

        self.device = Some(device);
        self.context = Some(context);
        self.executor = Some(executor);
        info!("Device and render context initialized");
        Ok(())
    }

    /// Create the passes recorded every frame, in submission order
    fn init_recorders(&mut self) -> Result<()> {
        let context = self
            .context
            .clone()
            .ok_or_else(|| anyhow!("Render context not initialized"))?;
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| anyhow!("Executor not initialized"))?;
        let (width, height) = (self.config.width, self.config.height);

        let vertices: Vec<u8> = [[-0.5f32, -0.5, 0.0], [-0.5, 0.5, 0.0], [0.5, -0.5, 0.0], [0.5, 0.5, 0.0]]
            .iter()
            .flatten()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let geometry = GeometryPassRecorder::new(
            context.clone(),
            executor,
            MeshData {
                vertices: &vertices,
                vertex_stride: 12,
                indices: &QUAD_INDICES,
            },
            PipelineStateId::from_raw(1),
            RootSignatureId::from_raw(1),
            width,
            height,
        )
        .context("failed to create geometry pass")?;
        let clear = ClearPassRecorder::new(context, width, height)
            .context("failed to create clear pass")?;

        self.recorders.push(Box::new(geometry));
        self.recorders.push(Box::new(clear));
        info!("Created {} recorders", self.recorders.len());
        Ok(())
    }

    /// Main frame loop
    fn run_loop(&mut self) -> Result<()> {
        info!("Entering frame loop...");
        let started = Instant::now();

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested");
                break;
            }
            if self.config.frames != 0 && self.frames_rendered >= self.config.frames {
                info!("Rendered {} frames", self.frames_rendered);
                break;
            }

            self.render_frame()?;
            self.frames_rendered += 1;

            if self.frames_rendered % 60 == 0 {
                let elapsed = started.elapsed().as_secs_f64();
                let memory = self.device.as_ref().map_or(0, |device| device.memory_used());
                info!(
                    "Frame {}: {:.1} fps, {} KiB of GPU memory",
                    self.frames_rendered,
                    self.frames_rendered as f64 / elapsed.max(f64::EPSILON),
                    memory / 1024
                );
            }
        }

        Ok(())
    }

    fn render_frame(&mut self) -> Result<()> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| anyhow!("Render context not initialized"))?;
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| anyhow!("Executor not initialized"))?;
        let inputs = frame_inputs(self.frames_rendered);

        let recorded: Vec<fence_ring::Result<SharedCommandList>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .recorders
                .iter_mut()
                .map(|recorder| {
                    let inputs = &inputs;
                    thread::Builder::new()
                        .name(format!("record-{}", recorder.name()))
                        .spawn_scoped(scope, move || recorder.record(inputs))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|_| {
                        Err(fence_ring::Error::InvalidArgument(
                            "recorder thread panicked".into(),
                        ))
                    }),
                    Err(err) => Err(fence_ring::Error::InvalidArgument(format!(
                        "failed to spawn recorder thread: {}",
                        err
                    ))),
                })
                .collect()
        });

        let mut lists = Vec::with_capacity(recorded.len());
        let mut failure = None;
        for (recorder, result) in self.recorders.iter().zip(recorded) {
            match result {
                Ok(list) => lists.push(Some(list)),
                Err(err) => {
                    error!("{} failed to record frame {}: {}", recorder.name(), inputs.frame_index, err);
                    failure.get_or_insert(err);
                    lists.push(None);
                }
            }
        }
        if let Some(err) = failure {
            for (recorder, list) in self.recorders.iter_mut().zip(&lists) {
                if list.is_some() {
                    recorder.abandon()?;
                }
            }
            return Err(err.into());
        }

        for list in lists.into_iter().flatten() {
            executor.add_command_list_to_execute(list)?;
        }
        let token = match executor.execute_command_lists() {
            Ok(token) => token,
            Err(err) => {
                for recorder in self.recorders.iter_mut() {
                    recorder.abandon()?;
                }
                return Err(err.into());
            }
        };
        for recorder in self.recorders.iter_mut() {
            recorder.submitted(token)?;
        }

        context
            .resources()
            .collect_retired(context.states(), context.fences())?;
        Ok(())
    }

    /// Wait for the GPU and release everything the context owns
    fn teardown(&mut self) -> Result<()> {
        if let Some(executor) = self.executor.as_ref() {
            info!("Flushing GPU work...");
            if let Err(err) = executor.flush() {
                warn!("Flush failed: {}", err);
            }
        }
        self.recorders.clear();
        self.executor = None;
        if let Some(context) = self.context.take() {
            context.shutdown()?;
        }
        if let Some(device) = self.device.take() {
            if device.is_removed() {
                bail!("device was removed during the run");
            }
        }
        Ok(())
    }
}

/// Clear color cycles with the frame; geometry spins around Z.
fn frame_inputs(frame_index: u64) -> FrameInputs {
    let mut inputs = FrameInputs::new(frame_index);
    let t = (frame_index % 360) as f32 / 360.0;
    inputs.clear_color = [t, 1.0 - t, 0.25, 1.0];

    let (sin, cos) = (t * std::f32::consts::TAU).sin_cos();
    inputs.world_view_projection[0] = [cos, -sin, 0.0, 0.0];
    inputs.world_view_projection[1] = [sin, cos, 0.0, 0.0];
    inputs
}

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("failed to load {}", path))?,
        None => Config::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Fence ring frame loop starting...");
    info!("Configuration loaded: {:?}", config);

    let mut service = RenderService::new(config);

    let shutdown = service.shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl+C handler")?;

    service.init_device()?;
    service.init_recorders()?;

    let result = service.run_loop();
    if let Err(err) = &result {
        error!("Frame loop failed: {:#}", err);
    }

    info!("Frame loop shutting down");
    let teardown = service.teardown();
    result.and(teardown)
}
