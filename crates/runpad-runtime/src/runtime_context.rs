use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use runpad_pipeline::Console;
use sha2::{Digest, Sha256};
use wasmtime::{Config, Engine, ExternType, FuncType, Linker, Module, Store};

use crate::error::RuntimeError;
use crate::wasistate::{ConsoleStdout, WasiState};

/// Import module name that resolves to WASI preview 1.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// How often running programs are given a chance to yield.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Default bound on captured stdout per run.
pub const DEFAULT_STDOUT_CAPACITY: usize = 1024 * 1024;

/// Shared Wasmtime engine, linker and library registry.
///
/// `RuntimeContext` is constructed once and shared by [`WatCompiler`] and
/// [`WasmLoader`], so libraries registered while initializing are linkable at
/// run time. The linker is pre-configured with WASI preview 1.
///
/// [`WatCompiler`]: crate::compiler::WatCompiler
/// [`WasmLoader`]: crate::loader::WasmLoader
pub struct RuntimeContext {
    pub engine: Engine,
    pub linker: Linker<WasiState>,
    stdout_capacity: usize,
    /// WASI preview 1 function name → signature
    wasi_functions: HashMap<String, FuncType>,
    /// module name → compiled library
    libraries: RwLock<HashMap<String, Module>>,
    /// SHA-256 of every artifact this context serialized
    issued: RwLock<HashSet<String>>,
}

impl RuntimeContext {
    pub fn new() -> Result<Self, RuntimeError> {
        let mut config = Config::new();
        config.async_support(true);
        // Long-running programs yield at epoch boundaries so they can be
        // cancelled.
        config.epoch_interruption(true);

        let engine = Engine::new(&config)?;
        let mut linker: Linker<WasiState> = Linker::new(&engine);
        wasmtime_wasi::preview1::add_to_linker_async(&mut linker, |state: &mut WasiState| {
            &mut state.wasi
        })?;
        let wasi_functions = wasi_signatures(&engine, &linker);

        spawn_epoch_ticker(&engine)?;
        tracing::debug!("RuntimeContext initialized (async + epoch interruption + WASI p1)");

        Ok(Self {
            engine,
            linker,
            stdout_capacity: DEFAULT_STDOUT_CAPACITY,
            wasi_functions,
            libraries: RwLock::new(HashMap::new()),
            issued: RwLock::new(HashSet::new()),
        })
    }

    pub fn with_stdout_capacity(mut self, bytes: usize) -> Self {
        self.stdout_capacity = bytes;
        self
    }

    pub fn stdout_capacity(&self) -> usize {
        self.stdout_capacity
    }

    /// Signature of the WASI preview 1 function `name`, if there is one.
    pub fn wasi_function(&self, name: &str) -> Option<&FuncType> {
        self.wasi_functions.get(name)
    }

    /// Make `module` linkable under `module_name`. Re-registering a name
    /// replaces the previous library.
    pub fn register_library(&self, module_name: &str, module: Module) {
        let previous = self
            .libraries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module_name.to_string(), module);
        if previous.is_some() {
            tracing::debug!(module_name, "Library replaced");
        } else {
            tracing::debug!(module_name, "Library registered");
        }
    }

    pub fn library(&self, module_name: &str) -> Option<Module> {
        self.libraries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module_name)
            .cloned()
    }

    pub fn library_count(&self) -> usize {
        self.libraries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Serialize `module` and remember the artifact as trusted.
    pub fn serialize(&self, module: &Module) -> Result<Vec<u8>, RuntimeError> {
        let bytes = module.serialize()?;
        self.issued
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(artifact_hash(&bytes));
        Ok(bytes)
    }

    /// Whether `bytes` is an artifact produced by [`Self::serialize`].
    pub fn issued(&self, bytes: &[u8]) -> bool {
        self.issued
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&artifact_hash(bytes))
    }
}

/// Read the WASI function types out of the linker. Looking a definition up
/// needs a store, so a throwaway one is used.
fn wasi_signatures(engine: &Engine, linker: &Linker<WasiState>) -> HashMap<String, FuncType> {
    let stdout = ConsoleStdout::new(Console::new(std::io::sink()).writer(), 0);
    let mut store = Store::new(engine, WasiState::new("", &[], stdout));
    let definitions: Vec<_> = linker
        .iter(&mut store)
        .filter(|(module, _, _)| *module == WASI_MODULE)
        .map(|(_, name, definition)| (name.to_string(), definition))
        .collect();
    definitions
        .into_iter()
        .filter_map(|(name, definition)| match definition.ty(&store) {
            ExternType::Func(ty) => Some((name, ty)),
            _ => None,
        })
        .collect()
}

fn artifact_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Advance the engine's epoch until the engine is dropped.
fn spawn_epoch_ticker(engine: &Engine) -> Result<(), RuntimeError> {
    let weak = engine.weak();
    std::thread::Builder::new()
        .name("runpad-epoch".into())
        .spawn(move || {
            loop {
                std::thread::sleep(EPOCH_TICK);
                match weak.upgrade() {
                    Some(engine) => engine.increment_epoch(),
                    None => break,
                }
            }
        })?;
    Ok(())
}
