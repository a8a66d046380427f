//! Real-time impulse-response convolution engine.
//!
//! The audio thread owns the [`Engine`] and calls [`Engine::process`] once
//! per host block; everything it touches there is an atomic load, a single
//! `try_lock` or preallocated storage. Slow work (opening the IR file,
//! resampling, FFT preparation) happens on the [`worker::Worker`] thread and
//! is published back through a kernel slot the audio thread polls. Control
//! surfaces talk to the same instance through an [`EngineController`] clone.

pub mod loader;
pub mod logger;
pub mod params;
pub mod state;
pub mod worker;

use irload_core::dsp::{DenormalGuard, GainStage, MixStage};
use irload_core::ConvolutionKernel;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use logger::InstanceLogger;
use state::{format_state, parse_state};
use worker::Worker;

pub use params::{ParamEvent, ParamValue, Parameter, ParameterTable};
pub use state::IR_FILE_NONE;

pub const PARAM_BYPASS: usize = 0;
pub const PARAM_GAIN: usize = 1;
pub const PARAM_WET_DRY: usize = 2;
pub const PARAM_NORMALISE: usize = 3;

const DEFAULT_SAMPLE_RATE: u32 = 48_000;
const DEFAULT_MAX_BLOCK: usize = 1024;

/// Snapshot of the persisted engine state, copied for observers.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    pub bypass: bool,
    pub gain: f32,
    pub wet_dry: f32,
    pub normalise: bool,
    pub ir_file: String,
}

enum KernelUpdate {
    Install(ConvolutionKernel),
    Clear,
}

/// Handoff point between the worker and the audio thread. The audio thread
/// only ever `try_lock`s it; kernels it displaces ride back out in `retired`
/// so their memory is freed off the audio path.
#[derive(Default)]
struct KernelSlot {
    update: Option<KernelUpdate>,
    retired: Option<ConvolutionKernel>,
}

/// What the last successful build was made from. A redundant swap request is
/// skipped only when every field still matches, so a sample-rate or block
/// change always rebuilds.
#[derive(Clone, PartialEq)]
struct BuildDescriptor {
    path: String,
    normalise: bool,
    sample_rate: u32,
    max_block: usize,
}

struct EngineShared {
    bypass: Arc<ParamValue>,
    gain: Arc<ParamValue>,
    wet_dry: Arc<ParamValue>,
    normalise: Arc<ParamValue>,
    params: ParameterTable,

    ir_file: RwLock<String>,
    swap_requested: AtomicBool,
    notify: AtomicBool,
    // Descriptor of the last successful build, for redundant-swap skips.
    kernel_ready: AtomicBool,
    active_build: RwLock<Option<BuildDescriptor>>,
    // Request fields handed to the worker by the dispatcher.
    job: RwLock<Option<(String, bool)>>,
    slot: Mutex<KernelSlot>,

    initialized: AtomicBool,
    pending_state: RwLock<Option<String>>,
    sample_rate: AtomicU32,
    max_block: AtomicUsize,

    worker: Worker,
    logger: Arc<InstanceLogger>,
}

pub struct Engine {
    shared: Arc<EngineShared>,

    // Audio-thread-only state.
    active: Option<ConvolutionKernel>,
    gain_stage: GainStage,
    mix_stage: MixStage,
    dry: Vec<f32>,
    max_block: usize,
    ready: bool,
}

/// Cloneable control-surface handle to one engine instance. Holds no
/// ownership of the DSP state; every operation goes through the documented
/// synchronization points.
#[derive(Clone)]
pub struct EngineController {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new() -> Self {
        let instance_id = logger::generate_instance_id();
        let logger = InstanceLogger::new(&instance_id);
        logger.info("Engine", "Creating new IRLoad engine instance...");

        let bypass = ParamValue::new(0.0);
        let gain = ParamValue::new(0.0);
        let wet_dry = ParamValue::new(100.0);
        let normalise = ParamValue::new(1.0);

        let mut table = ParameterTable::new();
        //             name         group     min    max    def    step  backing            stepped
        table.register("Bypass", "Global", 0.0, 1.0, 0.0, 1.0, bypass.clone(), true);
        table.register("Gain", "IR", -20.0, 20.0, 0.0, 0.1, gain.clone(), false);
        table.register("Wet/Dry", "IR", 0.0, 100.0, 100.0, 1.0, wet_dry.clone(), false);
        table.register("Normalise", "Global", 0.0, 1.0, 1.0, 1.0, normalise.clone(), true);

        let shared = Arc::new(EngineShared {
            bypass,
            gain,
            wet_dry,
            normalise,
            params: table,
            ir_file: RwLock::new(IR_FILE_NONE.to_string()),
            swap_requested: AtomicBool::new(false),
            notify: AtomicBool::new(false),
            kernel_ready: AtomicBool::new(false),
            active_build: RwLock::new(None),
            job: RwLock::new(None),
            slot: Mutex::new(KernelSlot::default()),
            initialized: AtomicBool::new(false),
            pending_state: RwLock::new(None),
            sample_rate: AtomicU32::new(0),
            max_block: AtomicUsize::new(0),
            worker: Worker::new("irload-worker"),
            logger,
        });

        // The worker's back-reference must not keep the instance alive.
        let weak = Arc::downgrade(&shared);
        shared.worker.arm(move || run_swap_job(&weak));

        Self {
            shared,
            active: None,
            gain_stage: GainStage::new(),
            mix_stage: MixStage::new(),
            dry: Vec::new(),
            max_block: 0,
            ready: false,
        }
    }

    /// Host stream configuration. Zero values fall back to safe defaults and
    /// the engine keeps passing audio (degraded, never fatal). Applies any
    /// state buffered by `read_state` and issues one swap request for a
    /// restored IR file.
    pub fn initialize(&mut self, sample_rate: u32, max_block: usize) {
        let shared = &self.shared;
        let sr = if sample_rate == 0 {
            shared.logger.warn(
                "Engine",
                "Host supplied sample rate 0Hz. Falling back to 48000Hz.",
            );
            DEFAULT_SAMPLE_RATE
        } else {
            sample_rate
        };
        let mb = if max_block == 0 {
            shared.logger.warn(
                "Engine",
                "Host supplied no maximum block size. Falling back to 1024.",
            );
            DEFAULT_MAX_BLOCK
        } else {
            max_block
        };

        let prev_sr = shared.sample_rate.swap(sr, Ordering::AcqRel);
        let prev_mb = shared.max_block.swap(mb, Ordering::AcqRel);
        let layout_changed = prev_sr != sr || prev_mb != mb;
        if layout_changed {
            // Any prepared kernel was built for the old layout.
            shared.kernel_ready.store(false, Ordering::Release);
            *shared.active_build.write() = None;
        }

        self.dry = vec![0.0; mb];
        self.max_block = mb;
        self.gain_stage.clear_state();
        self.ready = true;
        shared.initialized.store(true, Ordering::Release);
        shared.logger.info(
            "Engine",
            &format!("Initialized: {}Hz, max block {}.", sr, mb),
        );

        let buffered = shared.pending_state.write().take();
        if let Some(text) = buffered {
            shared.logger.info("Persistence", "Applying buffered state.");
            apply_state_fields(shared, &text);
            shared.swap_requested.store(true, Ordering::Release);
        } else if *shared.ir_file.read() != IR_FILE_NONE {
            shared
                .logger
                .info("Persistence", "Restoring IR file at new layout.");
            shared.swap_requested.store(true, Ordering::Release);
        }
    }

    /// Real-time block processing: bypass gate, denormal guard, dry copy,
    /// gain, convolution (only when the worker is idle and a kernel is
    /// ready), wet/dry mix. Bounded, allocation-free, never blocking.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        self.process_with_events(input, output, &[]);
    }

    /// Like [`Engine::process`], applying each timestamped parameter change
    /// at its sample offset before the frames at or after it.
    pub fn process_with_events(
        &mut self,
        input: &[f32],
        output: &mut [f32],
        events: &[ParamEvent],
    ) {
        let frames = input.len().min(output.len());
        if frames == 0 {
            return;
        }
        self.poll_kernel_slot();

        let mut start = 0usize;
        for event in events {
            let offset = (event.offset as usize).min(frames);
            if offset > start {
                self.process_span(&input[start..offset], &mut output[start..offset]);
                start = offset;
            }
            self.shared.params.set(event.index, event.value);
        }
        if start < frames {
            self.process_span(&input[start..frames], &mut output[start..frames]);
        }
    }

    /// Clear smoothing and convolver history (transport jumps, panic).
    pub fn reset_state(&mut self) {
        self.gain_stage.clear_state();
        if let Some(kernel) = self.active.as_mut() {
            kernel.reset_state();
        }
    }

    /// Latency introduced by the active kernel, in samples.
    pub fn latency_samples(&self) -> usize {
        self.active.as_ref().map_or(0, |k| k.latency_samples())
    }

    pub fn controller(&self) -> EngineController {
        EngineController {
            shared: self.shared.clone(),
        }
    }

    pub fn params(&self) -> &ParameterTable {
        &self.shared.params
    }

    pub fn request_kernel_swap(&self, path: &str, normalise: bool) {
        request_kernel_swap(&self.shared, path, normalise);
    }

    pub fn poll_and_dispatch_swap(&self) {
        poll_and_dispatch_swap(&self.shared);
    }

    pub fn take_kernel_notify(&self) -> bool {
        self.shared.notify.swap(false, Ordering::AcqRel)
    }

    pub fn state_snapshot(&self) -> EngineState {
        state_snapshot(&self.shared)
    }

    pub fn save_state(&self) -> String {
        save_state(&self.shared)
    }

    pub fn read_state(&self, text: &str) {
        read_state(&self.shared, text);
    }

    pub fn sync_dirty(&self, notify: impl FnMut(usize, f32)) {
        self.shared.params.sync_dirty(notify);
    }

    fn poll_kernel_slot(&mut self) {
        let Some(mut slot) = self.shared.slot.try_lock() else {
            // Worker is publishing right now; pick it up next block.
            return;
        };
        if let Some(update) = slot.update.take() {
            let displaced = match update {
                KernelUpdate::Install(kernel) => self.active.replace(kernel),
                KernelUpdate::Clear => self.active.take(),
            };
            if slot.retired.is_none() {
                slot.retired = displaced;
            }
            self.shared
                .logger
                .detailed_info("Engine", "Kernel slot flipped.");
        }
    }

    fn process_span(&mut self, input: &[f32], output: &mut [f32]) {
        if !self.ready || self.shared.bypass.get() >= 0.5 {
            output.copy_from_slice(input);
            return;
        }
        let mut i = 0usize;
        while i < input.len() {
            let take = (input.len() - i).min(self.max_block);
            self.process_chunk(&input[i..i + take], &mut output[i..i + take]);
            i += take;
        }
    }

    fn process_chunk(&mut self, input: &[f32], output: &mut [f32]) {
        let _guard = DenormalGuard::new();
        let frames = input.len();

        output.copy_from_slice(input);
        self.gain_stage.compute(self.shared.gain.get(), output);
        // The dry leg carries the gained signal, so a fully-dry mix is the
        // gain-only path rather than a raw bypass.
        self.dry[..frames].copy_from_slice(output);

        // Graceful degradation: while a swap is in flight the gained signal
        // passes through dry rather than waiting on the worker.
        if !self.shared.worker.is_busy() {
            if let Some(kernel) = self.active.as_mut() {
                if kernel.is_ready() {
                    kernel.compute(output);
                }
            }
        }

        self.mix_stage
            .compute(self.shared.wet_dry.get(), &self.dry[..frames], output);
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Stop and join the worker before any kernel storage goes away.
        self.shared.worker.shutdown();
        self.shared.logger.info("Engine", "Engine instance destroyed.");
        self.shared.logger.flush();
    }
}

impl EngineController {
    pub fn params(&self) -> &ParameterTable {
        &self.shared.params
    }

    pub fn request_kernel_swap(&self, path: &str, normalise: bool) {
        request_kernel_swap(&self.shared, path, normalise);
    }

    pub fn poll_and_dispatch_swap(&self) {
        poll_and_dispatch_swap(&self.shared);
    }

    pub fn take_kernel_notify(&self) -> bool {
        self.shared.notify.swap(false, Ordering::AcqRel)
    }

    pub fn state_snapshot(&self) -> EngineState {
        state_snapshot(&self.shared)
    }

    pub fn save_state(&self) -> String {
        save_state(&self.shared)
    }

    pub fn read_state(&self, text: &str) {
        read_state(&self.shared, text);
    }

    pub fn sync_dirty(&self, notify: impl FnMut(usize, f32)) {
        self.shared.params.sync_dirty(notify);
    }

    pub fn worker_busy(&self) -> bool {
        self.shared.worker.is_busy()
    }
}

fn valid_ir_name(path: &str) -> bool {
    path == IR_FILE_NONE || path.ends_with(".wav") || path.ends_with(".WAV")
}

fn request_kernel_swap(shared: &EngineShared, path: &str, normalise: bool) {
    if !valid_ir_name(path) {
        shared.logger.detailed_info(
            "Engine",
            &format!("Ignored swap request for unsupported file {:?}.", path),
        );
        return;
    }
    shared
        .params
        .set(PARAM_NORMALISE, if normalise { 1.0 } else { 0.0 });
    *shared.ir_file.write() = path.to_string();
    // Fields above are published before the latch so the dispatcher never
    // reads a torn request.
    shared.swap_requested.store(true, Ordering::Release);
}

fn poll_and_dispatch_swap(shared: &EngineShared) {
    // Reclaim whatever the audio thread displaced since the last tick.
    shared.slot.lock().retired = None;

    if !shared.initialized.load(Ordering::Acquire) {
        return;
    }
    if !shared.swap_requested.load(Ordering::Acquire) {
        return;
    }
    if shared.worker.is_busy() {
        // Stays latched; retried next tick with whatever fields are newest.
        return;
    }
    shared.swap_requested.store(false, Ordering::Release);

    let path = shared.ir_file.read().clone();
    let normalise = shared.normalise.get() >= 0.5;
    let requested = BuildDescriptor {
        path,
        normalise,
        sample_rate: shared.sample_rate.load(Ordering::Acquire),
        max_block: shared.max_block.load(Ordering::Acquire),
    };

    if shared.kernel_ready.load(Ordering::Acquire) {
        if shared.active_build.read().as_ref() == Some(&requested) {
            shared.logger.detailed_info(
                "Engine",
                &format!(
                    "Swap request for {:?} deduped (already active).",
                    requested.path
                ),
            );
            return;
        }
    } else if requested.path == IR_FILE_NONE {
        // Nothing loaded and nothing to load.
        return;
    }

    let path = requested.path;

    *shared.job.write() = Some((path, normalise));
    if !shared.worker.trigger() {
        // Lost the race with a concurrent dispatcher; keep the request.
        shared.swap_requested.store(true, Ordering::Release);
    }
}

/// The worker's unit of work: build (or clear) the kernel named by the
/// pending request and publish the result. Runs on the worker thread.
fn run_swap_job(weak: &Weak<EngineShared>) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let Some((path, normalise)) = shared.job.write().take() else {
        return;
    };
    let sample_rate = shared.sample_rate.load(Ordering::Acquire);
    let max_block = shared.max_block.load(Ordering::Acquire);

    if path == IR_FILE_NONE {
        let mut slot = shared.slot.lock();
        slot.update = Some(KernelUpdate::Clear);
        slot.retired = None;
        drop(slot);
        shared.kernel_ready.store(false, Ordering::Release);
        *shared.active_build.write() = None;
        shared.logger.info("Worker", "Cleared active kernel.");
    } else {
        match loader::build_kernel(
            Path::new(&path),
            normalise,
            sample_rate,
            max_block,
            &shared.logger,
        ) {
            Ok(kernel) => {
                let latency = kernel.latency_samples();
                let mut slot = shared.slot.lock();
                slot.update = Some(KernelUpdate::Install(kernel));
                slot.retired = None;
                drop(slot);
                shared.kernel_ready.store(true, Ordering::Release);
                *shared.active_build.write() = Some(BuildDescriptor {
                    path: path.clone(),
                    normalise,
                    sample_rate,
                    max_block,
                });
                shared.logger.info(
                    "Worker",
                    &format!(
                        "Kernel ready: {} (normalise={}, latency={} samples).",
                        path, normalise, latency
                    ),
                );
            }
            Err(e) => {
                shared
                    .logger
                    .error("Worker", &format!("Kernel build failed: {:#}", e));
                {
                    // Reset to the sentinel unless a newer request already
                    // replaced the path; the newest request must win.
                    let mut ir_file = shared.ir_file.write();
                    if *ir_file == path {
                        *ir_file = IR_FILE_NONE.to_string();
                    }
                }
                shared.kernel_ready.store(false, Ordering::Release);
                *shared.active_build.write() = None;
                let mut slot = shared.slot.lock();
                slot.update = Some(KernelUpdate::Clear);
                slot.retired = None;
            }
        }
    }

    // Observers learn the effective state (including a failure fallback to
    // "None") from this flag, success or not.
    shared.notify.store(true, Ordering::Release);
}

fn apply_state_fields(shared: &EngineShared, text: &str) {
    let parsed = parse_state(text);
    if let Some(gain) = parsed.gain {
        shared.params.set(PARAM_GAIN, gain);
    }
    if let Some(wet_dry) = parsed.wet_dry {
        shared.params.set(PARAM_WET_DRY, wet_dry);
    }
    if let Some(bypass) = parsed.bypass {
        shared
            .params
            .set(PARAM_BYPASS, if bypass { 1.0 } else { 0.0 });
    }
    if let Some(normalise) = parsed.normalise {
        shared
            .params
            .set(PARAM_NORMALISE, if normalise { 1.0 } else { 0.0 });
    }
    if let Some(ir_file) = parsed.ir_file {
        *shared.ir_file.write() = ir_file;
    }
}

fn read_state(shared: &EngineShared, text: &str) {
    if !shared.initialized.load(Ordering::Acquire) {
        shared
            .logger
            .info("Persistence", "State arrived before init; buffering.");
        *shared.pending_state.write() = Some(text.to_string());
        return;
    }
    apply_state_fields(shared, text);
    shared.swap_requested.store(true, Ordering::Release);
}

fn save_state(shared: &EngineShared) -> String {
    format_state(
        shared.gain.get(),
        shared.wet_dry.get(),
        shared.bypass.get() >= 0.5,
        shared.normalise.get() >= 0.5,
        &shared.ir_file.read(),
    )
}

fn state_snapshot(shared: &EngineShared) -> EngineState {
    EngineState {
        bypass: shared.bypass.get() >= 0.5,
        gain: shared.gain.get(),
        wet_dry: shared.wet_dry.get(),
        normalise: shared.normalise.get() >= 0.5,
        ir_file: shared.ir_file.read().clone(),
    }
}
