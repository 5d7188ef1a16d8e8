//! Embedded JavaScript runtime for PAC routing scripts.

mod js_engine;
mod pac_functions;

pub use js_engine::{PacScript, ENTRY_POINT};
