//! Pipeline Compiler - Installing Lazy Traces Across a Diffusion Pipeline
//!
//! [`compile`] walks the components of a [`DiffusionPipeline`] and replaces
//! their entry points with lazily compiling wrappers:
//!
//! - `unet.forward` and `controlnet.forward`, with replay capture on CUDA
//! - `text_encoder.forward`
//! - `vae` `decode`, `encoder.forward` and `quant_conv.forward`
//! - scheduler `scale_model_input` and `step` when requested
//!
//! Parameters of the convolutional components are converted to the configured
//! memory format before anything is traced. The kernel backend is resolved
//! once per call and shared by every wrapper.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use diffjit::{compile_unet, CompilationConfig};
//! use diffjit_core::{DType, Device};
//! use diffjit_jit::{CallArgs, ParamStore, Submodule, Value};
//!
//! let params = Arc::new(ParamStore::new());
//! let forward = |args: &CallArgs| -> diffjit_core::Result<Value> {
//!     Ok(Value::Tensor(args.tensor(0)?.silu()?))
//! };
//! let mut unet = Submodule::new("unet", Device::Cpu, DType::F32, params)
//!     .with_entry_point("forward", Arc::new(forward));
//! let report = compile_unet(&mut unet, &CompilationConfig::default()).unwrap();
//! assert_eq!(report.targets(), vec!["unet.forward"]);
//! ```
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, info_span, warn, Span};

use diffjit_core::{Device, MemoryFormat};
use diffjit_jit::{install_with_context, GraphCompiler, JitContext, LazyTrace, Submodule};

use crate::backend::KernelBackend;
use crate::config::CompilationConfig;
use crate::error::{PipelineError, PipelineResult};

// =============================================================================
// Pipeline Structure
// =============================================================================

/// Variational autoencoder of a latent diffusion pipeline.
#[derive(Debug)]
pub struct Vae {
    /// Latent-to-image decoder, exposing `decode`.
    pub decoder: Submodule,
    /// Image-to-latent encoder, used by image-to-image pipelines.
    pub encoder: Submodule,
    /// Convolution applied to encoder moments.
    pub quant_conv: Submodule,
}

impl Vae {
    /// Groups the three autoencoder parts.
    pub fn new(decoder: Submodule, encoder: Submodule, quant_conv: Submodule) -> Self {
        Self {
            decoder,
            encoder,
            quant_conv,
        }
    }

    fn to_memory_format(&mut self, format: MemoryFormat) -> PipelineResult<()> {
        self.decoder.to_memory_format(format)?;
        self.encoder.to_memory_format(format)?;
        self.quant_conv.to_memory_format(format)?;
        Ok(())
    }
}

/// The components of a diffusion pipeline the compiler knows about.
#[derive(Debug)]
pub struct DiffusionPipeline {
    /// Device the pipeline runs on.
    pub device: Device,
    /// Denoising network.
    pub unet: Submodule,
    /// Optional conditioning network run alongside the UNet.
    pub controlnet: Option<Submodule>,
    /// Prompt encoder.
    pub text_encoder: Submodule,
    /// Autoencoder.
    pub vae: Vae,
    /// Optional noise scheduler with `scale_model_input` and `step`.
    pub scheduler: Option<Submodule>,
}

impl DiffusionPipeline {
    /// Creates a pipeline without controlnet or scheduler.
    pub fn new(device: Device, unet: Submodule, text_encoder: Submodule, vae: Vae) -> Self {
        Self {
            device,
            unet,
            controlnet: None,
            text_encoder,
            vae,
            scheduler: None,
        }
    }

    /// Builder: attach a controlnet.
    #[must_use]
    pub fn with_controlnet(mut self, controlnet: Submodule) -> Self {
        self.controlnet = Some(controlnet);
        self
    }

    /// Builder: attach a scheduler.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Submodule) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

// =============================================================================
// Compile Report
// =============================================================================

/// Wrappers installed by one compile call, keyed by `component.entry`.
#[derive(Debug, Clone, Default)]
pub struct CompileReport {
    backend: KernelBackend,
    wrappers: BTreeMap<String, Arc<LazyTrace>>,
}

impl CompileReport {
    fn new(backend: KernelBackend) -> Self {
        Self {
            backend,
            wrappers: BTreeMap::new(),
        }
    }

    /// The kernel backend the wrappers compile for.
    pub fn backend(&self) -> KernelBackend {
        self.backend
    }

    /// The wrapper installed for `target`, e.g. `"unet.forward"`.
    pub fn wrapper(&self, target: &str) -> Option<&Arc<LazyTrace>> {
        self.wrappers.get(target)
    }

    /// Sorted names of the wrapped entry points.
    pub fn targets(&self) -> Vec<&str> {
        self.wrappers.keys().map(String::as_str).collect()
    }

    /// Number of installed wrappers.
    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    /// True when nothing was installed.
    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    /// Total compilations across every wrapper so far.
    pub fn compilations(&self) -> usize {
        self.wrappers
            .values()
            .map(|w| w.cache().stats().compilations)
            .sum()
    }

    fn merge(&mut self, other: Self) {
        self.wrappers.extend(other.wrappers);
    }
}

// =============================================================================
// Compilation
// =============================================================================

struct Compilers {
    plain: Arc<GraphCompiler>,
    replay: Arc<GraphCompiler>,
}

impl Compilers {
    fn new(config: &CompilationConfig, backend: KernelBackend) -> Self {
        Self {
            plain: Arc::new(GraphCompiler::new(config.jit_config(backend, false))),
            replay: Arc::new(GraphCompiler::new(config.jit_config(backend, true))),
        }
    }
}

fn require_entry(module: &Submodule, entry: &str) -> PipelineResult<()> {
    if module.has_entry_point(entry) {
        Ok(())
    } else {
        Err(PipelineError::MissingEntryPoint {
            component: module.name().to_string(),
            entry: entry.to_string(),
        })
    }
}

/// Checks every entry point `compile` will wrap, before anything is changed.
fn check_entries(pipeline: &DiffusionPipeline, config: &CompilationConfig) -> PipelineResult<()> {
    if !config.enable_jit {
        return Ok(());
    }
    require_entry(&pipeline.unet, "forward")?;
    if let Some(controlnet) = &pipeline.controlnet {
        require_entry(controlnet, "forward")?;
    }
    require_entry(&pipeline.text_encoder, "forward")?;
    require_entry(&pipeline.vae.decoder, "decode")?;
    require_entry(&pipeline.vae.encoder, "forward")?;
    require_entry(&pipeline.vae.quant_conv, "forward")?;
    if config.trace_scheduler {
        let scheduler = pipeline.scheduler.as_ref().ok_or_else(|| {
            PipelineError::InvalidConfig(
                "trace_scheduler is set but the pipeline has no scheduler".into(),
            )
        })?;
        require_entry(scheduler, "scale_model_input")?;
        require_entry(scheduler, "step")?;
    }
    Ok(())
}

fn install_entry(
    module: &mut Submodule,
    entry: &str,
    compiler: &Arc<GraphCompiler>,
    span: &Span,
    report: &mut CompileReport,
) -> PipelineResult<()> {
    require_entry(module, entry)?;
    let target = format!("{}.{entry}", module.name());
    let ctx = JitContext::child_of(span, target.clone());
    let wrapper = install_with_context(module, entry, Arc::clone(compiler), ctx)?;
    report.wrappers.insert(target, wrapper);
    Ok(())
}

fn compile_denoiser(
    module: &mut Submodule,
    config: &CompilationConfig,
    compilers: &Compilers,
    span: &Span,
) -> PipelineResult<CompileReport> {
    let mut report = CompileReport::default();
    if let Some(format) = config.memory_format {
        module.to_memory_format(format)?;
    }
    if !config.enable_jit {
        if config.enable_cuda_graph {
            warn!(component = module.name(), "replay capture needs lazy tracing, skipped");
        }
        return Ok(report);
    }

    let replay = config.enable_cuda_graph && module.device().is_cuda();
    let compiler = if replay {
        &compilers.replay
    } else {
        &compilers.plain
    };
    install_entry(module, "forward", compiler, span, &mut report)?;
    info!(component = module.name(), replay, "denoiser wrapped");
    Ok(report)
}

/// Compiles a UNet-like denoiser in place.
///
/// Converts its parameters to the configured memory format and wraps
/// `forward`. Replay capture is enabled when requested and the module lives
/// on a CUDA device.
pub fn compile_unet(
    module: &mut Submodule,
    config: &CompilationConfig,
) -> PipelineResult<CompileReport> {
    if config.enable_jit {
        require_entry(module, "forward")?;
    }
    let backend = KernelBackend::resolve(config, module.device());
    let span = info_span!("compile_unet", component = module.name(), backend = %backend);
    let compilers = Compilers::new(config, backend);
    let mut report = CompileReport::new(backend);
    report.merge(compile_denoiser(module, config, &compilers, &span)?);
    Ok(report)
}

/// Compiles every component of `pipeline` in place.
pub fn compile(
    pipeline: &mut DiffusionPipeline,
    config: &CompilationConfig,
) -> PipelineResult<CompileReport> {
    check_entries(pipeline, config)?;
    let device = pipeline.device;
    let backend = KernelBackend::resolve(config, device);
    let span = info_span!("compile", device = %device, backend = %backend);
    let compilers = Compilers::new(config, backend);
    let mut report = CompileReport::new(backend);

    report.merge(compile_denoiser(&mut pipeline.unet, config, &compilers, &span)?);
    if let Some(controlnet) = pipeline.controlnet.as_mut() {
        report.merge(compile_denoiser(controlnet, config, &compilers, &span)?);
    }

    if let Some(format) = config.memory_format {
        pipeline.vae.to_memory_format(format)?;
    }

    if config.enable_jit {
        let plain = &compilers.plain;
        install_entry(&mut pipeline.text_encoder, "forward", plain, &span, &mut report)?;
        install_entry(&mut pipeline.vae.decoder, "decode", plain, &span, &mut report)?;
        install_entry(&mut pipeline.vae.encoder, "forward", plain, &span, &mut report)?;
        install_entry(&mut pipeline.vae.quant_conv, "forward", plain, &span, &mut report)?;
        if let Some(scheduler) = pipeline.scheduler.as_mut().filter(|_| config.trace_scheduler) {
            install_entry(scheduler, "scale_model_input", plain, &span, &mut report)?;
            install_entry(scheduler, "step", plain, &span, &mut report)?;
        }
    }

    span.in_scope(|| {
        info!(
            wrappers = report.len(),
            memory_format = ?config.memory_format,
            "pipeline compiled"
        );
    });
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffjit_core::{DType, Result};
    use diffjit_jit::{CallArgs, Forward, ParamStore, Value};

    fn identity() -> Arc<dyn Forward> {
        Arc::new(|args: &CallArgs| -> Result<Value> {
            Ok(Value::Tensor(args.tensor(0)?.mul_scalar(1.0)?))
        })
    }

    fn part(name: &str, entry: &str, device: Device) -> Submodule {
        Submodule::new(name, device, DType::F32, Arc::new(ParamStore::new()))
            .with_entry_point(entry, identity())
    }

    fn pipeline(device: Device) -> DiffusionPipeline {
        let vae = Vae::new(
            part("vae", "decode", device),
            part("vae.encoder", "forward", device),
            part("vae.quant_conv", "forward", device),
        );
        DiffusionPipeline::new(
            device,
            part("unet", "forward", device),
            part("text_encoder", "forward", device),
            vae,
        )
    }

    #[test]
    fn test_compile_installs_every_component() {
        let mut p = pipeline(Device::Cpu);
        let report = compile(&mut p, &CompilationConfig::default()).unwrap();
        assert_eq!(
            report.targets(),
            vec![
                "text_encoder.forward",
                "unet.forward",
                "vae.decode",
                "vae.encoder.forward",
                "vae.quant_conv.forward",
            ]
        );
        assert_eq!(report.backend(), KernelBackend::Default);
    }

    #[test]
    fn test_jit_disabled_installs_nothing() {
        let mut p = pipeline(Device::Cpu);
        let config = CompilationConfig::default().enable_jit(false);
        assert!(compile(&mut p, &config).unwrap().is_empty());
    }

    #[test]
    fn test_scheduler_requires_component() {
        let mut p = pipeline(Device::Cpu);
        let config = CompilationConfig::default().trace_scheduler(true);
        assert!(matches!(
            compile(&mut p, &config),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_decode_entry() {
        let mut p = pipeline(Device::Cpu);
        p.vae.decoder = part("vae", "forward", Device::Cpu);
        let err = compile(&mut p, &CompilationConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingEntryPoint { ref entry, .. } if entry == "decode"
        ));
    }

    #[test]
    fn test_failed_compile_leaves_pipeline_untouched() {
        let mut p = pipeline(Device::Cpu);
        p.scheduler = Some(part("scheduler", "step", Device::Cpu));
        let unet_before = p.unet.entry_point("forward").unwrap();
        let config = CompilationConfig::default()
            .memory_format(Some(MemoryFormat::ChannelsLast))
            .trace_scheduler(true);
        let err = compile(&mut p, &config).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingEntryPoint { ref entry, .. } if entry == "scale_model_input"
        ));
        assert!(Arc::ptr_eq(&p.unet.entry_point("forward").unwrap(), &unet_before));
        assert_eq!(p.unet.memory_format(), MemoryFormat::Contiguous);
        assert_eq!(p.vae.decoder.memory_format(), MemoryFormat::Contiguous);
    }

    #[test]
    fn test_replay_only_for_denoisers_on_cuda() {
        let config = CompilationConfig::for_device(Device::Cuda(0)).enable_cuda_graph(true);
        let mut p = pipeline(Device::Cuda(0)).with_controlnet(part("controlnet", "forward", Device::Cuda(0)));
        let report = compile(&mut p, &config).unwrap();
        assert!(report.wrapper("unet.forward").unwrap().replay_enabled());
        assert!(report.wrapper("controlnet.forward").unwrap().replay_enabled());
        assert!(!report.wrapper("text_encoder.forward").unwrap().replay_enabled());
        assert!(!report.wrapper("vae.decode").unwrap().replay_enabled());

        let mut cpu = part("unet", "forward", Device::Cpu);
        let report = compile_unet(&mut cpu, &config).unwrap();
        assert!(!report.wrapper("unet.forward").unwrap().replay_enabled());
    }
}
