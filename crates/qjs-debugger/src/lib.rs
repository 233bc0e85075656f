//! `qjs-debugger` is a remote debugger engine to embed in a script virtual machine.
//!
//! The VM implements [`DebugHost`] and calls the [`Debugger`] hooks while it
//! runs; a client attached over a [`Transport`] sets breakpoints, steps and
//! inspects frames using newline-delimited JSON messages.
//!
//! ## Examples
//!
//! ```rs
//! use qjs_debugger::{Debugger, DebuggerConfig};
//!
//! let mut debugger = Debugger::new(DebuggerConfig::from_env());
//! debugger.attach_from_config()?;
//!
//! // at every statement boundary
//! debugger.on_instrumentable_point(&mut vm, pc);
//! // on a coarse tick
//! debugger.cooperate(&mut vm, pc);
//! ```
mod breakpoints;
mod channel;
mod config;
mod engine;
mod error;
mod host;
mod location;
mod session;
mod stepping;

pub mod connector;
pub mod log;
pub mod protocol;
pub mod transport;

pub use breakpoints::{BreakpointTable, FunctionBreakpoints, FunctionLayout, LineEntry, Refresh};
pub use channel::{DEFAULT_MAX_MESSAGE_LEN, MessageChannel};
pub use config::DebuggerConfig;
pub use engine::Debugger;
pub use error::{ChannelError, ConnectionError, ProtocolError, RequestError, TransportError};
pub use host::{DebugHost, FunctionSlot};
pub use location::Location;
pub use stepping::{StepController, StepMode};
pub use transport::{MemoryTransport, Peek, PipeTransport, TcpTransport, Transport};
