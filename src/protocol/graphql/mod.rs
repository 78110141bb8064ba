//! `graphql-ws` sub-protocol.
//!
//! # Data Flow
//! ```text
//! connection_init → OperationHandler::on_init → connection_ack
//! subscribe {id}  → OperationHandler::subscribe → stream
//!                 → pump task: next* → complete | error
//! stop {id}       → cancel token, drop registry entry
//! socket closed   → cancel every token
//! ```

pub mod handle;
pub mod layer;
pub mod messages;

pub use handle::GraphqlRoute;
pub use layer::{LayerState, OperationHandler, OperationLayer, OperationStream};
pub use messages::{ClientMessage, ErrorPayload, OperationPayload, ServerMessage, GRAPHQL_WS};
