//! Routing decisions: the hot-reloaded PAC engine and its directive parser.

mod directive;
mod engine;
mod watcher;

pub use directive::{Directive, DirectiveKind, ProxyAddr};
pub use engine::{FileSource, Fingerprint, RoutingEngine, ScriptSource};
pub use watcher::spawn_reload_watcher;
