//! The live routing decision function.
//!
//! Exactly one script version is current at any time. Readers take a
//! snapshot (`Arc` clone) under a short read lock and run the whole decision
//! against it; the reload path builds and validates a complete new version
//! before swapping the pointer, so a decision never sees a partial script.

use super::directive::Directive;
use crate::error::ScriptError;
use crate::scripting::PacScript;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info};

/// Change-detection stamp for a script source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

/// Where routing script bytes come from.
pub trait ScriptSource: Send + Sync {
    /// Human-readable origin used in logs and errors.
    fn describe(&self) -> String;
    fn fingerprint(&self) -> io::Result<Fingerprint>;
    fn read(&self) -> io::Result<String>;
}

/// A routing script stored on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ScriptSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn fingerprint(&self) -> io::Result<Fingerprint> {
        let meta = std::fs::metadata(&self.path)?;
        Ok(Fingerprint {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }

    fn read(&self) -> io::Result<String> {
        std::fs::read_to_string(&self.path)
    }
}

/// One published script version.
#[derive(Debug)]
struct Loaded {
    script: PacScript,
    generation: u64,
}

pub struct RoutingEngine {
    source: Box<dyn ScriptSource>,
    current: RwLock<Arc<Loaded>>,
    /// Last fingerprint the reload path acted on. Also serialises reloads.
    last_seen: Mutex<Option<Fingerprint>>,
}

impl RoutingEngine {
    /// Load the initial script. Failure here is fatal for the caller: there is
    /// no earlier version to fall back on.
    pub fn new(source: impl ScriptSource + 'static) -> Result<Self, ScriptError> {
        let fingerprint = source.fingerprint().ok();
        let script = compile_from(&source)?;
        info!("loaded routing script {}", source.describe());

        Ok(Self {
            source: Box::new(source),
            current: RwLock::new(Arc::new(Loaded {
                script,
                generation: 1,
            })),
            last_seen: Mutex::new(fingerprint),
        })
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ScriptError> {
        Self::new(FileSource::new(path))
    }

    fn snapshot(&self) -> Arc<Loaded> {
        Arc::clone(&self.current.read())
    }

    /// Run the current decision function for `url`/`host` and parse its answer.
    ///
    /// A script that fails to run yields `Err`; a script that runs and returns
    /// something unrecognised yields an `Invalid` directive.
    pub fn decide(&self, url: &str, host: &str) -> Result<Directive, ScriptError> {
        let loaded = self.snapshot();
        let decision = loaded.script.find_proxy(url, host)?;
        info!("{} -> {}", url, decision);
        Ok(Directive::parse(&decision))
    }

    /// Re-read and recompile the script, publishing it on success.
    ///
    /// On failure the previously loaded version stays in effect.
    pub fn reload(&self) -> Result<u64, ScriptError> {
        let mut last_seen = self.last_seen.lock();
        *last_seen = self.source.fingerprint().ok();
        self.reload_locked()
    }

    /// Reload only if the source's fingerprint moved since the last attempt.
    ///
    /// Returns `None` when nothing changed. A broken edit is attempted once;
    /// the next attempt happens when the source changes again.
    pub fn reload_if_changed(&self) -> Option<Result<u64, ScriptError>> {
        let mut last_seen = self.last_seen.lock();
        let fingerprint = match self.source.fingerprint() {
            Ok(fp) => fp,
            Err(e) => {
                debug!("cannot stat routing script {}: {}", self.source.describe(), e);
                return None;
            }
        };
        if *last_seen == Some(fingerprint) {
            return None;
        }
        *last_seen = Some(fingerprint);

        info!("reloading {}", self.source.describe());
        Some(self.reload_locked())
    }

    fn reload_locked(&self) -> Result<u64, ScriptError> {
        match compile_from(self.source.as_ref()) {
            Ok(script) => {
                let mut current = self.current.write();
                let generation = current.generation + 1;
                *current = Arc::new(Loaded { script, generation });
                info!(
                    "routing script {} is now generation {}",
                    self.source.describe(),
                    generation
                );
                Ok(generation)
            }
            Err(e) => {
                error!(
                    "rejected reload of {}, keeping generation {}: {}",
                    self.source.describe(),
                    self.generation(),
                    e
                );
                Err(e)
            }
        }
    }

    /// Monotonic counter bumped on every successful reload.
    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// The script currently in effect.
    pub fn script(&self) -> PacScript {
        self.snapshot().script.clone()
    }

    pub fn describe_source(&self) -> String {
        self.source.describe()
    }
}

fn compile_from(source: &dyn ScriptSource) -> Result<PacScript, ScriptError> {
    let text = source.read().map_err(|e| ScriptError::Io {
        path: source.describe(),
        source: e,
    })?;
    PacScript::compile(text)
}
