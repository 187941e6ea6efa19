//! signals-script — the boundary between stored signals and untrusted
//! encoder programs.
//!
//! - [`argument`] renders a buyer's signals into the map handed to the script
//! - [`driver`] wraps the buyer's program so binary data crosses the sandbox
//!   as hex (or base64) text
//! - [`sandbox`] defines the sandbox collaborator and a process-backed one
//! - [`engine`] runs an encode and validates what comes back

pub mod argument;
pub mod driver;
pub mod engine;
pub mod error;
pub mod hex_codec;
pub mod sandbox;

pub use argument::{SignalsArgument, render_signals};
pub use engine::SignalsScriptEngine;
pub use error::{ScriptError, ScriptFailureClass, ScriptResult};
pub use hex_codec::{binary_to_hex, hex_to_binary};
pub use sandbox::{CommandSandbox, IsolateSettings, NamedArgument, ScriptSandbox};
