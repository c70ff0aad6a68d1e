//! Client-facing server layer: wire protocol types, the
//! request dispatcher, and persistent library storage. Socket framing and
//! connection lifecycle are deliberately left to `main.rs` — the pieces
//! here only need an `mpsc::Sender<ServerEvent>` per connected client.

pub mod protocol;
pub mod router;
pub mod store;

pub use protocol::{ClientRequest, ServerEvent};
pub use router::Router;
