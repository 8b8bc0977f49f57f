//! Capabilities the session borrows from the embedding: the program runtime,
//! its module table and its audio output.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::params::ProgramInvocation;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The program itself raised; reported to the user, the session carries on.
    #[error("program error: {0}")]
    Program(String),
    #[error(transparent)]
    Host(#[from] anyhow::Error),
}

pub trait ProgramHost: Send {
    fn install_packages(&mut self, packages: &[String]) -> Result<()> {
        let _ = packages;
        Ok(())
    }

    fn enable_virtual_gamepad(&mut self) -> Result<()> {
        Ok(())
    }

    fn launch(&mut self, invocation: &ProgramInvocation) -> Result<(), LaunchError>;

    /// One iteration of the program's main loop.
    fn step(&mut self) -> Result<()>;

    /// Asks the program to quit and cancels its main loop.
    fn stop(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedModule {
    pub name: String,
    pub file: Option<String>,
}

pub trait ModuleRegistry: Send + Sync {
    fn loaded_modules(&self) -> Vec<LoadedModule>;
    fn unregister(&self, name: &str) -> Result<()>;
    fn invalidate_caches(&self);
    /// Installs a fresh, empty module under `name`.
    fn install_entry_module(&self, name: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioState {
    Running,
    Suspended,
    Closed,
}

pub trait AudioChannel: Send + Sync {
    fn state(&self) -> AudioState;
    fn suspend(&self);
    fn resume(&self);
}

#[derive(Debug, Default)]
struct ModuleTable {
    modules: BTreeMap<String, Option<String>>,
    pinned: BTreeSet<String>,
}

/// Module table kept in memory, for embeddings that track imports themselves.
#[derive(Debug, Default)]
pub struct MemoryModuleRegistry {
    table: Mutex<ModuleTable>,
    cache_generation: AtomicU64,
}

impl MemoryModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ModuleTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, name: &str, file: Option<&str>) {
        self.lock()
            .modules
            .insert(name.to_string(), file.map(str::to_string));
    }

    /// Pinned modules refuse to be unregistered.
    pub fn pin(&self, name: &str) {
        self.lock().pinned.insert(name.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().modules.contains_key(name)
    }

    pub fn file_of(&self, name: &str) -> Option<String> {
        self.lock().modules.get(name).cloned().flatten()
    }

    pub fn cache_generation(&self) -> u64 {
        self.cache_generation.load(Ordering::SeqCst)
    }
}

impl ModuleRegistry for MemoryModuleRegistry {
    fn loaded_modules(&self) -> Vec<LoadedModule> {
        self.lock()
            .modules
            .iter()
            .map(|(name, file)| LoadedModule {
                name: name.clone(),
                file: file.clone(),
            })
            .collect()
    }

    fn unregister(&self, name: &str) -> Result<()> {
        let mut table = self.lock();
        if table.pinned.contains(name) {
            return Err(anyhow!("module {} is pinned", name));
        }
        table.modules.remove(name);
        Ok(())
    }

    fn invalidate_caches(&self) {
        self.cache_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn install_entry_module(&self, name: &str) {
        self.lock().modules.insert(name.to_string(), None);
    }
}
