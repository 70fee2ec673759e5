//! Shader cache: definitions are loaded on request, stage modules and
//! pipelines are built in [`ShaderCache::create_pending`].

use kiln_assets::{AssetError, AssetStore};
use rustc_hash::FxHashMap;

use crate::backend::{BackendError, GpuBackend, ShaderStage};
use crate::definition::{DefinitionError, ShaderDefinition, load_definition};
use crate::pipeline::{CompiledPipelineInfo, PipelineError};
use crate::render_pass::RenderPassId;

/// Errors raised while resolving or compiling a shader.
#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("shader {shader} declares no stages")]
    NoStages { shader: String },

    #[error("failed to read {stage:?} source for shader {shader}: {source}")]
    Source {
        shader: String,
        stage: ShaderStage,
        #[source]
        source: AssetError,
    },

    #[error("failed to compile {stage:?} stage of shader {shader}: {source}")]
    Module {
        shader: String,
        stage: ShaderStage,
        #[source]
        source: BackendError,
    },
}

/// Outcome of asking a pipeline factory to build a shader's pipeline.
pub enum PipelineBuild<B: GpuBackend> {
    Built(B::Pipeline),
    /// Something the pipeline depends on does not exist yet; try next frame.
    NotReady,
    Failed(PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(usize);

/// Where a shader is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderState {
    /// Waiting for the next `create_pending`.
    Pending,
    /// Modules compiled; the pipeline is waiting on its dependencies.
    AwaitingPipeline,
    Ready,
    Failed,
}

pub struct Shader<B: GpuBackend> {
    key: String,
    definition: ShaderDefinition,
    pipeline_info: Option<CompiledPipelineInfo>,
    render_pass: Option<RenderPassId>,
    modules: Vec<(ShaderStage, B::ShaderModule)>,
    pipeline: Option<B::Pipeline>,
    state: ShaderState,
}

impl<B: GpuBackend> Shader<B> {
    /// Definition path the shader was loaded from.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn definition(&self) -> &ShaderDefinition {
        &self.definition
    }

    pub fn pipeline_info(&self) -> Option<&CompiledPipelineInfo> {
        self.pipeline_info.as_ref()
    }

    pub fn render_pass(&self) -> Option<RenderPassId> {
        self.render_pass
    }

    pub fn modules(&self) -> impl Iterator<Item = (ShaderStage, &B::ShaderModule)> {
        self.modules.iter().map(|(stage, module)| (*stage, module))
    }

    pub fn pipeline(&self) -> Option<&B::Pipeline> {
        self.pipeline.as_ref()
    }

    pub fn state(&self) -> ShaderState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ShaderState::Ready
    }
}

/// Shaders keyed by definition path.
pub struct ShaderCache<B: GpuBackend> {
    shaders: Vec<Shader<B>>,
    by_key: FxHashMap<String, ShaderId>,
    pending: Vec<ShaderId>,
}

impl<B: GpuBackend> Default for ShaderCache<B> {
    fn default() -> Self {
        Self {
            shaders: Vec::new(),
            by_key: FxHashMap::default(),
            pending: Vec::new(),
        }
    }
}

impl<B: GpuBackend> ShaderCache<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the shader defined at `path`.
    pub fn shader(&mut self, assets: &dyn AssetStore, path: &str) -> Result<ShaderId, ShaderError> {
        if let Some(id) = self.find(path) {
            return Ok(id);
        }
        let definition: ShaderDefinition = load_definition(assets, path)?;
        self.shader_from_definition(path, definition)
    }

    /// Get or create the shader for an already loaded definition.
    pub fn shader_from_definition(
        &mut self,
        path: &str,
        definition: ShaderDefinition,
    ) -> Result<ShaderId, ShaderError> {
        if let Some(id) = self.find(path) {
            return Ok(id);
        }
        if definition.stages().iter().next().is_none() {
            return Err(ShaderError::NoStages {
                shader: path.to_string(),
            });
        }
        let id = ShaderId(self.shaders.len());
        self.shaders.push(Shader {
            key: path.to_string(),
            definition,
            pipeline_info: None,
            render_pass: None,
            modules: Vec::new(),
            pipeline: None,
            state: ShaderState::Pending,
        });
        self.by_key.insert(path.to_string(), id);
        self.pending.push(id);
        log::debug!("Queued shader {path}");
        Ok(id)
    }

    /// Give a shader the pipeline state and render pass its pipeline should
    /// be built with. A shader whose pipeline already exists keeps it.
    pub fn attach_pipeline(
        &mut self,
        id: ShaderId,
        info: CompiledPipelineInfo,
        render_pass: Option<RenderPassId>,
    ) {
        let Some(shader) = self.shaders.get_mut(id.0) else {
            return;
        };
        if shader.pipeline.is_some() {
            log::debug!("Shader {} already has a pipeline, keeping it", shader.key);
            return;
        }
        shader.pipeline_info = Some(info);
        shader.render_pass = render_pass;
        if shader.state == ShaderState::AwaitingPipeline && !self.pending.contains(&id) {
            self.pending.push(id);
        }
    }

    pub fn find(&self, path: &str) -> Option<ShaderId> {
        self.by_key.get(path).copied()
    }

    pub fn get(&self, id: ShaderId) -> Option<&Shader<B>> {
        self.shaders.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Compile stage modules for queued shaders and hand each to `build` for
    /// its pipeline. Shaders whose pipeline is not ready yet stay queued.
    /// Returns how many shaders became ready.
    pub fn create_pending<F>(&mut self, backend: &mut B, assets: &dyn AssetStore, mut build: F) -> usize
    where
        F: FnMut(&mut B, &Shader<B>) -> PipelineBuild<B>,
    {
        let mut ready = 0;
        let mut requeue = Vec::new();
        for id in std::mem::take(&mut self.pending) {
            let shader = &mut self.shaders[id.0];
            if shader.state == ShaderState::Pending {
                match compile_modules(backend, assets, shader) {
                    Ok(modules) => {
                        shader.modules = modules;
                        shader.state = ShaderState::AwaitingPipeline;
                    }
                    Err(err) => {
                        log::error!("{err}");
                        shader.state = ShaderState::Failed;
                        continue;
                    }
                }
            }

            match build(backend, shader) {
                PipelineBuild::Built(pipeline) => {
                    shader.pipeline = Some(pipeline);
                    shader.state = ShaderState::Ready;
                    ready += 1;
                    log::debug!("Shader {} ready", shader.key);
                }
                PipelineBuild::NotReady => requeue.push(id),
                PipelineBuild::Failed(err) => {
                    log::error!("Failed to build pipeline for shader {}: {err}", shader.key);
                    shader.state = ShaderState::Failed;
                }
            }
        }
        self.pending = requeue;
        ready
    }

    /// Release every pipeline and module.
    pub fn destroy(&mut self, backend: &mut B) {
        for shader in self.shaders.drain(..) {
            if let Some(pipeline) = shader.pipeline {
                backend.destroy_pipeline(pipeline);
            }
            for (_, module) in shader.modules {
                backend.destroy_shader_module(module);
            }
        }
        self.by_key.clear();
        self.pending.clear();
    }
}

fn compile_modules<B: GpuBackend>(
    backend: &mut B,
    assets: &dyn AssetStore,
    shader: &Shader<B>,
) -> Result<Vec<(ShaderStage, B::ShaderModule)>, ShaderError> {
    let mut modules = Vec::new();
    let result = shader.definition.stages().iter().try_for_each(|(stage, path)| {
        let source = assets.read_text(path).map_err(|source| ShaderError::Source {
            shader: shader.key.clone(),
            stage,
            source,
        })?;
        let label = format!("{}:{path}", shader.key);
        let module = backend
            .create_shader_module(&label, stage, &source)
            .map_err(|source| ShaderError::Module {
                shader: shader.key.clone(),
                stage,
                source,
            })?;
        modules.push((stage, module));
        Ok(())
    });
    match result {
        Ok(()) => Ok(modules),
        Err(err) => {
            for (_, module) in modules {
                backend.destroy_shader_module(module);
            }
            Err(err)
        }
    }
}
