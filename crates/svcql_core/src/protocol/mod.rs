//! Wire formats: the binary row stream written for queries and the bracket
//! command envelope used for remote control.
pub mod codec;
pub mod control;

pub use codec::{QueryPreamble, RowStreamReader, RowStreamWriter};
pub use control::{ControlCommand, handle_command, send_control_command, serve_control_request};
