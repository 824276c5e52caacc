//! Module load and unload

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use ilsplice_core::config::gamedata_path;
use ilsplice_core::{
    ConfigError, CoreConfig, Dispatcher, Gamedata, GamedataError, MethodPatch, PatchError,
    PatchRegistry, TemplateError,
};
use ilsplice_host::MethodHost;

use crate::logging::init_logging;

/// Errors raised while loading or unloading a module
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Gamedata error: {0}")]
    Gamedata(#[from] GamedataError),

    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),
}

pub type ModuleResult<T> = Result<T, ModuleError>;

/// Extension points built while loading report as malformed templates
impl From<TemplateError> for ModuleError {
    fn from(e: TemplateError) -> Self {
        ModuleError::Patch(PatchError::MalformedTemplate(e))
    }
}

/// A loaded module: every method patch installed.
///
/// Call [`Module::unload`] on shutdown. Dropping a module that still has
/// patches installed restores them as well, but cannot report failures.
pub struct Module {
    config: CoreConfig,
    registry: PatchRegistry,
}

impl Module {
    /// Register and install `patches` against `host`.
    ///
    /// Nothing stays installed when this fails.
    #[instrument(skip_all)]
    pub fn load(
        host: Arc<dyn MethodHost>,
        config: CoreConfig,
        patches: Vec<MethodPatch>,
    ) -> ModuleResult<Self> {
        info!("ilsplice loading {} method patch(es)...", patches.len());

        let registry = PatchRegistry::new(host).with_strict(config.strict);
        for patch in patches {
            let target = patch.target().to_string();
            if let Err(e) = registry.register(patch) {
                error!("Failed to register patch for {}: {}", target, e);
                return Err(e.into());
            }
        }

        let outcomes = registry.install_all().inspect_err(|e| {
            error!("ilsplice load failed: {}", e);
        })?;

        let fallbacks = outcomes
            .iter()
            .flat_map(|o| o.handle().applied())
            .filter(|r| r.used_fallback())
            .count();
        info!(
            "ilsplice loaded: {} method(s) patched, {} point(s) on fallback anchors",
            outcomes.len(),
            fallbacks
        );

        Ok(Self { config, registry })
    }

    /// Build patches from gamedata anchors, then [`load`](Self::load) them.
    ///
    /// # Arguments
    /// * `build` - Turns the anchor table into method patches
    pub fn load_with<F>(
        host: Arc<dyn MethodHost>,
        config: CoreConfig,
        gamedata: &Gamedata,
        build: F,
    ) -> ModuleResult<Self>
    where
        F: FnOnce(&Gamedata) -> ModuleResult<Vec<MethodPatch>>,
    {
        let patches = build(gamedata)?;
        Self::load(host, config, patches)
    }

    /// Load `configs/core.toml` and the configured anchors file from the
    /// base directory, initialize logging, then install.
    pub fn load_from_disk<F>(host: Arc<dyn MethodHost>, build: F) -> ModuleResult<Self>
    where
        F: FnOnce(&Gamedata) -> ModuleResult<Vec<MethodPatch>>,
    {
        let config = CoreConfig::load()?;
        init_logging(&config);

        let path = gamedata_path(&config.gamedata)?;
        let gamedata = Gamedata::load_from_file(&path).inspect_err(|e| {
            error!("Failed to load gamedata from {:?}: {}", path, e);
        })?;

        Self::load_with(host, config, &gamedata, build)
    }

    /// Restore every original body.
    ///
    /// # Returns
    /// Number of methods restored.
    ///
    /// # Panics
    /// When the host refuses to take an original body back. The method is
    /// then left running a body nobody owns anymore, which is not a state
    /// the host can continue from.
    #[instrument(skip_all)]
    pub fn unload(self) -> ModuleResult<usize> {
        info!("ilsplice unloading...");

        match self.registry.uninstall_all() {
            Ok(restored) => Ok(restored),
            Err(PatchError::RestoreFailed { method, source }) => {
                error!("Could not restore {}: {}", method, source);
                panic!("ilsplice: could not restore {}: {}", method, source);
            }
            Err(e) => {
                error!("ilsplice unload failed: {}", e);
                Err(e.into())
            }
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &PatchRegistry {
        &self.registry
    }

    /// Callback table the host routes injected dispatch calls through
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        self.registry.dispatcher()
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if std::thread::panicking() || self.registry.installed().is_empty() {
            return;
        }

        warn!("Module dropped without unload, restoring original bodies");
        if let Err(e) = self.registry.uninstall_all() {
            error!("Restore on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ilsplice_core::sdk::{FieldRef, Instruction, Label, MethodBody, MethodRef, TypeRef, Value};
    use ilsplice_core::{Callback, ExtensionPointSpec, SpliceError};
    use ilsplice_host::MemoryHost;

    const REFILL: &str = "Celeste.Refill::OnPlayer";

    const ANCHORS: &str = r#"{
        "refill.level-check": {
            "primary": "ldfld Refill::level; brfalse",
            "fallbacks": ["ldfld Refill::level; ?1; brfalse"]
        }
    }"#;

    fn refill_body() -> MethodBody {
        MethodBody::new(vec![
            Instruction::ldarg(0),
            Instruction::call(MethodRef::new_instance("Celeste.Refill", "Collect", 0, false)),
            Instruction::ldarg(0),
            Instruction::ldfld(FieldRef::new("Celeste.Refill", "level")),
            Instruction::brfalse(Label(0)),
            Instruction::call(MethodRef::new_static("Celeste.Refill", "EmitParticles", 0, false)),
            Instruction::ldarg(0),
            Instruction::call(MethodRef::new_instance("Celeste.Refill", "PlaySound", 0, false)),
            Instruction::nop(),
            Instruction::ret(),
        ])
        .with_label(Label(0), 6)
    }

    fn refill_patches(gamedata: &Gamedata) -> ModuleResult<Vec<MethodPatch>> {
        let spec = ExtensionPointSpec::consume(
            "refill.particles",
            TypeRef::new("Mods.IRefillParticles"),
            gamedata.anchor("refill.level-check")?,
        )
        .build()?;

        Ok(vec![MethodPatch::new(REFILL).point(
            spec,
            Callback::consume(|active| matches!(active, Value::Object(_))),
        )])
    }

    fn setup() -> (Arc<MemoryHost>, ilsplice_host::MethodId, Gamedata) {
        let host = Arc::new(MemoryHost::new());
        let id = host.define(REFILL, refill_body());
        let gamedata = Gamedata::load_from_str(ANCHORS).unwrap();
        (host, id, gamedata)
    }

    #[test]
    fn test_load_then_unload() {
        let (host, id, gamedata) = setup();

        let module =
            Module::load_with(host.clone(), CoreConfig::default(), &gamedata, refill_patches)
                .unwrap();
        assert!(host.is_modified(id));
        assert_eq!(module.registry().installed(), vec![id]);

        assert_eq!(module.unload().unwrap(), 1);
        assert!(!host.is_modified(id));
        assert_eq!(host.active_body(id), host.pristine_body(id));
    }

    #[test]
    fn test_dispatcher_reaches_callback() {
        let (host, _, gamedata) = setup();
        let module =
            Module::load_with(host, CoreConfig::default(), &gamedata, refill_patches).unwrap();

        let handled = module
            .dispatcher()
            .consume("refill.particles", &Value::object(7, "Mods.RedRefill"))
            .unwrap();
        assert!(handled);
        assert!(!module
            .dispatcher()
            .consume("refill.particles", &Value::Null)
            .unwrap());

        module.unload().unwrap();
    }

    #[test]
    fn test_failed_load_leaves_host_untouched() {
        let (host, id, _) = setup();
        let gamedata = Gamedata::load_from_str(
            r#"{ "refill.level-check": { "primary": "ldfld Refill::level; brtrue" } }"#,
        )
        .unwrap();

        match Module::load_with(host.clone(), CoreConfig::default(), &gamedata, refill_patches) {
            Err(ModuleError::Patch(PatchError::Splice { source, .. })) => {
                assert!(matches!(source, SpliceError::PatternNotFound { .. }));
            }
            Err(e) => panic!("expected a splice error, got {}", e),
            Ok(_) => panic!("expected load to fail"),
        }
        assert!(!host.is_modified(id));
        assert_eq!(host.activation_count(id), 0);
    }

    #[test]
    fn test_missing_anchor_fails_before_install() {
        let (host, id, _) = setup();
        let empty = Gamedata::load_from_str("{}").unwrap();

        assert!(matches!(
            Module::load_with(host.clone(), CoreConfig::default(), &empty, refill_patches),
            Err(ModuleError::Gamedata(GamedataError::AnchorNotFound(_)))
        ));
        assert!(!host.is_modified(id));
    }

    #[test]
    fn test_malformed_point_fails_load() {
        let (host, id, gamedata) = setup();
        let unnamed = |gamedata: &Gamedata| -> ModuleResult<Vec<MethodPatch>> {
            let spec = ExtensionPointSpec::consume(
                "",
                TypeRef::new("Mods.IRefillParticles"),
                gamedata.anchor("refill.level-check")?,
            )
            .build()?;
            Ok(vec![MethodPatch::new(REFILL).point(spec, Callback::consume(|_| true))])
        };

        assert!(matches!(
            Module::load_with(host.clone(), CoreConfig::default(), &gamedata, unnamed),
            Err(ModuleError::Patch(PatchError::MalformedTemplate(TemplateError::EmptyName)))
        ));
        assert!(!host.is_modified(id));
    }

    #[test]
    #[should_panic(expected = "could not restore")]
    fn test_unload_panics_when_restore_fails() {
        let (host, id, gamedata) = setup();
        let module =
            Module::load_with(host.clone(), CoreConfig::default(), &gamedata, refill_patches)
                .unwrap();

        host.set_locked(id, true);
        let _ = module.unload();
    }

    #[test]
    fn test_drop_restores() {
        let (host, id, gamedata) = setup();
        {
            let _module =
                Module::load_with(host.clone(), CoreConfig::default(), &gamedata, refill_patches)
                    .unwrap();
            assert!(host.is_modified(id));
        }
        assert!(!host.is_modified(id));
    }

    #[test]
    fn test_load_from_disk() {
        let base = std::env::temp_dir().join(format!("ilsplice-module-{}", std::process::id()));
        std::fs::create_dir_all(base.join("gamedata")).unwrap();
        std::fs::write(base.join("gamedata").join("anchors.json"), ANCHORS).unwrap();
        std::env::set_var(ilsplice_core::config::BASE_DIR_ENV, &base);

        let (host, id, _) = setup();
        let module = Module::load_from_disk(host.clone(), refill_patches).unwrap();
        assert!(base.join("configs").join("core.toml").exists());
        assert!(module.config().strict);
        assert!(host.is_modified(id));

        module.unload().unwrap();
        assert!(!host.is_modified(id));

        let _ = std::fs::remove_dir_all(&base);
    }
}
