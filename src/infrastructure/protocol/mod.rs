//! Tool invocation protocol: JSON-RPC 2.0 framing, a client runtime with
//! request correlation and reconnection, and a server runtime with bounded
//! concurrency and graceful drain.

pub mod client;
pub mod error;
pub mod server;
pub mod transport;
pub mod types;

pub use client::{ClientOptions, ConnectionState, ProtocolClient};
pub use error::{ProtocolError, TransportError};
pub use server::{ProtocolServer, ResourceError, ResourceHandler, ServerOptions};
pub use transport::{Connector, PairTransport, StdioConnector, StdioTransport, Transport};
pub use types::{
    methods, ContentBlock, ErrorCode, InitializeResult, Notification, PeerInfo, PromptDescriptor,
    ProtocolMessage, Request, ResourceDescriptor, Response, RpcError, ServerCapabilities,
    ToolDescriptor, ToolResult, JSONRPC_VERSION, PROTOCOL_VERSION,
};
