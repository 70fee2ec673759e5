//! Materials: a shader, the render pass it draws into, its fixed-function
//! state, bound textures and clear values. Texture-set variants of a
//! material are instances owned by the root material.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use kiln_assets::AssetStore;
use rustc_hash::FxHashMap;

use crate::backend::{ClearValue, GpuBackend};
use crate::definition::{
    DefinitionError, MaterialDefinition, PipelineStateDefinition, RenderPassDefinition,
    ShaderDefinition, load_definition,
};
use crate::pipeline::CompiledPipelineInfo;
use crate::render_pass::RenderPassId;
use crate::renderer::Renderer;
use crate::shader::{ShaderError, ShaderId};
use crate::texture::{TextureError, TextureRef};

/// Which definition a material failed to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    Material,
    Shader,
    RenderPass,
    Pipeline,
}

impl fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Material => "material",
            Self::Shader => "shader",
            Self::RenderPass => "render pass",
            Self::Pipeline => "shader pipeline",
        })
    }
}

/// Errors that abort material compilation.
#[derive(Debug, thiserror::Error)]
pub enum MaterialError {
    #[error("failed to load {kind} definition {path}: {source}")]
    DefinitionLoad {
        kind: DefinitionKind,
        path: String,
        #[source]
        source: DefinitionError,
    },

    #[error("failed to load texture {texture}: {source}")]
    Texture {
        texture: String,
        #[source]
        source: TextureError,
    },

    #[error(transparent)]
    Shader(#[from] ShaderError),
}

#[derive(Debug)]
pub struct Material {
    pub name: String,
    pub shader: ShaderId,
    /// Unset when the render pass failed to construct.
    pub render_pass: Option<RenderPassId>,
    pub pipeline_info: CompiledPipelineInfo,
    pub textures: Vec<TextureRef>,
    pub clears: Vec<ClearValue>,
    instances: RefCell<FxHashMap<String, Rc<Material>>>,
    root: Option<Weak<Material>>,
}

impl Material {
    pub fn new(
        name: impl Into<String>,
        shader: ShaderId,
        render_pass: Option<RenderPassId>,
        pipeline_info: CompiledPipelineInfo,
        textures: Vec<TextureRef>,
        clears: Vec<ClearValue>,
    ) -> Self {
        Self {
            name: name.into(),
            shader,
            render_pass,
            pipeline_info,
            textures,
            clears,
            instances: RefCell::new(FxHashMap::default()),
            root: None,
        }
    }

    /// The variant of this material bound to `textures`. Equal texture sets
    /// return the same instance. Instances never hold instances of their
    /// own; asking one forwards to its root, and asking one whose root is
    /// gone yields an uncached variant.
    pub fn create_instance(self: &Rc<Self>, textures: &[TextureRef]) -> Rc<Material> {
        if let Some(root) = &self.root {
            return match root.upgrade() {
                Some(root) => root.create_instance(textures),
                None => {
                    log::warn!(
                        "Material '{}' outlived its root; instance is not cached",
                        self.name
                    );
                    Rc::new(self.variant(textures, Weak::clone(root)))
                }
            };
        }

        let key = instance_key(textures);
        if let Some(instance) = self.instances.borrow().get(&key) {
            return Rc::clone(instance);
        }

        let instance = Rc::new(self.variant(textures, Rc::downgrade(self)));
        self.instances.borrow_mut().insert(key, Rc::clone(&instance));
        instance
    }

    fn variant(&self, textures: &[TextureRef], root: Weak<Material>) -> Material {
        Material {
            name: self.name.clone(),
            shader: self.shader,
            render_pass: self.render_pass,
            pipeline_info: self.pipeline_info.clone(),
            textures: textures.to_vec(),
            clears: self.clears.clone(),
            instances: RefCell::new(FxHashMap::default()),
            root: Some(root),
        }
    }

    /// The material this one is an instance of, while it is alive.
    pub fn root(&self) -> Option<Rc<Material>> {
        self.root.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_instance(&self) -> bool {
        self.root.is_some()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.borrow().len()
    }

    /// Whether every resource the material names was created.
    pub fn is_complete(&self) -> bool {
        self.render_pass.is_some()
    }
}

fn instance_key(textures: &[TextureRef]) -> String {
    textures.iter().fold(String::new(), |mut key, texture| {
        key.push_str(&texture.key);
        key.push(';');
        key
    })
}

fn load<T: serde::de::DeserializeOwned>(
    assets: &dyn AssetStore,
    kind: DefinitionKind,
    path: &str,
) -> Result<T, MaterialError> {
    load_definition(assets, path).map_err(|source| MaterialError::DefinitionLoad {
        kind,
        path: path.to_string(),
        source,
    })
}

impl MaterialDefinition {
    /// Resolve every resource the definition names through the renderer's
    /// caches. A render pass that fails to construct is logged and leaves
    /// the material incomplete; every other failure aborts.
    pub fn compile<B: GpuBackend>(
        &self,
        assets: &dyn AssetStore,
        renderer: &mut Renderer<B>,
    ) -> Result<Material, MaterialError> {
        let shader_def: ShaderDefinition = load(assets, DefinitionKind::Shader, &self.shader)?;
        let pass_def: RenderPassDefinition =
            load(assets, DefinitionKind::RenderPass, &self.render_pass)?;
        let pipeline_def: PipelineStateDefinition =
            load(assets, DefinitionKind::Pipeline, &self.shader_pipeline)?;

        let render_pass = match renderer
            .render_passes
            .get_or_construct(&mut renderer.backend, &pass_def)
        {
            Ok(id) => Some(id),
            Err(err) => {
                log::error!(
                    "Material {} could not construct render pass {}: {err}",
                    self.name,
                    pass_def.name
                );
                None
            }
        };

        let pipeline_info = pipeline_def.compile().resolve_for(&shader_def);
        let shader = renderer
            .shaders
            .shader_from_definition(&self.shader, shader_def)?;
        renderer
            .shaders
            .attach_pipeline(shader, pipeline_info.clone(), render_pass);

        let mut textures = Vec::with_capacity(self.textures.len());
        for def in &self.textures {
            let texture = renderer
                .textures
                .texture(assets, &def.texture, def.filter())
                .map_err(|source| MaterialError::Texture {
                    texture: def.texture.clone(),
                    source,
                })?;
            textures.push(texture);
        }

        let clears = self
            .clears
            .iter()
            .map(|def| {
                let (value, issue) = def.resolve();
                if let Some(issue) = issue {
                    log::error!("Material {}: {issue}, using {value:?}", self.name);
                }
                value
            })
            .collect();

        Ok(Material::new(
            self.name.clone(),
            shader,
            render_pass,
            pipeline_info,
            textures,
            clears,
        ))
    }
}

/// Compiled materials keyed by definition path.
#[derive(Default)]
pub struct MaterialCache {
    materials: FxHashMap<String, Rc<Material>>,
}

impl MaterialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Rc<Material>> {
        self.materials.get(path).cloned()
    }

    pub fn insert(&mut self, path: &str, material: Material) -> Rc<Material> {
        let material = Rc::new(material);
        self.materials
            .insert(path.to_string(), Rc::clone(&material));
        material
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    pub fn clear(&mut self) {
        self.materials.clear();
    }
}

/// Load and compile the material at `path`.
pub fn load_material<B: GpuBackend>(
    assets: &dyn AssetStore,
    renderer: &mut Renderer<B>,
    path: &str,
) -> Result<Material, MaterialError> {
    let def: MaterialDefinition = load(assets, DefinitionKind::Material, path)?;
    def.compile(assets, renderer)
}

#[cfg(test)]
mod tests {
    use kiln_assets::MemoryAssetStore;
    use kiln_config::RenderConfig;

    use super::*;
    use crate::backend::TextureFilter;
    use crate::backend::recording::RecordingBackend;
    use crate::render_pass::tests::forward_pass_json;
    use crate::texture::tests::png_bytes;

    const MATERIAL: &str = r#"{
        "Name": "brick",
        "Shader": "shaders/basic.shader.json",
        "RenderPass": "passes/forward.renderpass.json",
        "ShaderPipeline": "pipelines/opaque.pipeline.json",
        "Textures": [
            { "Texture": "textures/brick.png", "Filter": "Linear" },
            { "Texture": "textures/normal.png", "Filter": "CubicImg" }
        ],
        "Clears": [{ "IsColor": true, "R": 1.0, "G": 0.0, "B": 0.0, "A": 1.0 }]
    }"#;

    fn assets() -> MemoryAssetStore {
        let mut assets = MemoryAssetStore::new();
        assets.insert_text(
            "shaders/basic.shader.json",
            r#"{ "Vert": "shaders/basic.vert.wgsl", "Frag": "shaders/basic.frag.wgsl", "Textures": 2 }"#,
        );
        assets.insert_text("shaders/basic.vert.wgsl", "// vertex");
        assets.insert_text("shaders/basic.frag.wgsl", "// fragment");
        assets.insert_text("passes/forward.renderpass.json", forward_pass_json());
        assets.insert_text(
            "pipelines/opaque.pipeline.json",
            r#"{ "DepthStencil": { "DepthTest": true, "DepthWrite": true }, "ColorBlend": { "Attachments": [{}] } }"#,
        );
        assets.insert_bytes("textures/brick.png", png_bytes(2, 2, [200, 80, 60, 255]));
        assets.insert_bytes("textures/normal.png", png_bytes(2, 2, [128, 128, 255, 255]));
        assets.insert_bytes("textures/moss.png", png_bytes(1, 1, [40, 120, 40, 255]));
        assets.insert_text("materials/brick.material.json", MATERIAL);
        assets
    }

    fn renderer() -> Renderer<RecordingBackend> {
        Renderer::new(RecordingBackend::new(), &RenderConfig::default())
    }

    fn compile(assets: &MemoryAssetStore, renderer: &mut Renderer<RecordingBackend>) -> Material {
        load_material(assets, renderer, "materials/brick.material.json").unwrap()
    }

    #[test]
    fn test_compile_resolves_textures_and_clears() {
        let assets = assets();
        let mut renderer = renderer();
        let material = compile(&assets, &mut renderer);

        assert_eq!(material.name, "brick");
        assert_eq!(material.textures.len(), 2);
        assert_eq!(material.clears, vec![ClearValue::Color([1.0, 0.0, 0.0, 1.0])]);
        assert!(material.is_complete());
        assert!(material.pipeline_info.depth_stencil.depth_test);
        assert_eq!(
            material.textures[1].key.as_ref(),
            "textures/normal.png#linear"
        );
        assert!(
            renderer
                .textures
                .find("textures/brick.png", TextureFilter::Linear)
                .is_some()
        );
    }

    #[test]
    fn test_compile_reuses_render_pass_and_shader() {
        let assets = assets();
        let mut renderer = renderer();
        let first = compile(&assets, &mut renderer);
        let second = compile(&assets, &mut renderer);
        assert_eq!(first.shader, second.shader);
        assert_eq!(first.render_pass, second.render_pass);
        assert_eq!(renderer.render_passes.len(), 1);
        assert_eq!(renderer.shaders.len(), 1);
    }

    #[test]
    fn test_missing_pipeline_definition_names_kind() {
        let mut assets = assets();
        assets.remove("pipelines/opaque.pipeline.json");
        let mut renderer = renderer();
        let err = load_material(&assets, &mut renderer, "materials/brick.material.json").unwrap_err();
        assert!(matches!(
            err,
            MaterialError::DefinitionLoad {
                kind: DefinitionKind::Pipeline,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_texture_aborts() {
        let mut assets = assets();
        assets.remove("textures/normal.png");
        let mut renderer = renderer();
        let err = load_material(&assets, &mut renderer, "materials/brick.material.json").unwrap_err();
        match err {
            MaterialError::Texture { texture, .. } => assert_eq!(texture, "textures/normal.png"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_render_pass_failure_leaves_material_incomplete() {
        let assets = assets();
        let mut renderer = renderer();
        renderer.backend.fail_always("create_render_pass");
        let material = compile(&assets, &mut renderer);
        assert!(!material.is_complete());
        assert_eq!(material.textures.len(), 2);
    }

    #[test]
    fn test_inconsistent_clears_fall_back() {
        let mut assets = assets();
        assets.insert_text(
            "materials/odd.material.json",
            r#"{
                "Name": "odd",
                "Shader": "shaders/basic.shader.json",
                "RenderPass": "passes/forward.renderpass.json",
                "ShaderPipeline": "pipelines/opaque.pipeline.json",
                "Clears": [
                    { "IsColor": true, "IsDepthStencil": true, "Depth": 1.0 },
                    { "R": 0.5, "A": 1.0 }
                ]
            }"#,
        );
        let mut renderer = renderer();
        let material = load_material(&assets, &mut renderer, "materials/odd.material.json").unwrap();
        assert_eq!(
            material.clears,
            vec![
                ClearValue::DepthStencil {
                    depth: 1.0,
                    stencil: 0
                },
                ClearValue::Color([0.5, 0.0, 0.0, 1.0]),
            ]
        );
    }

    #[test]
    fn test_instances_are_cached_by_texture_set() {
        let assets = assets();
        let mut renderer = renderer();
        let root = Rc::new(compile(&assets, &mut renderer));
        let moss = renderer
            .textures
            .texture(&assets, "textures/moss.png", TextureFilter::Nearest)
            .unwrap();

        let a = root.create_instance(&root.textures);
        let b = root.create_instance(&root.textures);
        let c = root.create_instance(std::slice::from_ref(&moss));

        assert!(Rc::ptr_eq(&a, &b));
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(root.instance_count(), 2);
        assert_eq!(c.textures, vec![moss]);
        assert!(c.is_instance());
        assert!(Rc::ptr_eq(&c.root().unwrap(), &root));
    }

    #[test]
    fn test_instance_never_caches_instances() {
        let assets = assets();
        let mut renderer = renderer();
        let root = Rc::new(compile(&assets, &mut renderer));
        let instance = root.create_instance(&root.textures[..1]);
        assert_eq!(instance.instance_count(), 0);

        let nested = instance.create_instance(&root.textures);
        assert_eq!(instance.instance_count(), 0);
        assert_eq!(root.instance_count(), 2);
        assert!(Rc::ptr_eq(&nested.root().unwrap(), &root));
    }

    #[test]
    fn test_instance_outliving_root_stays_uncached() {
        let assets = assets();
        let mut renderer = renderer();
        let root = Rc::new(compile(&assets, &mut renderer));
        let textures = root.textures.clone();
        let instance = root.create_instance(&textures[..1]);
        drop(root);
        assert!(instance.root().is_none());

        let variant = instance.create_instance(&textures);
        assert_eq!(instance.instance_count(), 0);
        assert!(variant.is_instance());
        assert_eq!(variant.textures.len(), textures.len());
        assert_eq!(variant.create_instance(&textures[..1]).instance_count(), 0);
        assert_eq!(variant.instance_count(), 0);
    }

    #[test]
    fn test_instance_key_concatenates_texture_keys() {
        let assets = assets();
        let mut renderer = renderer();
        let material = compile(&assets, &mut renderer);
        assert_eq!(
            instance_key(&material.textures),
            "textures/brick.png#linear;textures/normal.png#linear;"
        );
        assert_eq!(instance_key(&[]), "");
    }

    #[test]
    fn test_material_cache() {
        let assets = assets();
        let mut renderer = renderer();
        let mut cache = MaterialCache::new();
        let material = cache.insert("m", compile(&assets, &mut renderer));
        assert!(Rc::ptr_eq(&cache.get("m").unwrap(), &material));
        assert_eq!(cache.len(), 1);
    }
}
