//! # peerwire
//!
//! Peer-symmetric JSON-RPC 2.0 runtime over duplex message transports.
//!
//! Both endpoints of a connection are equals: each can issue typed
//! requests and notifications, and each can handle typed requests and
//! notifications from the other side, concurrently, over one multiplexed
//! channel.
//!
//! ## Architecture
//!
//! - **Transport** ([`transport`]): a duplex channel of whole JSON-RPC
//!   messages with a connection-state signal. Consumed as a trait;
//!   network transports live outside this crate.
//! - **Stream-based channel** ([`channel`]): request/response
//!   multiplexing - id generation, response correlation, inbound
//!   dispatch.
//! - **Typed channel** ([`typed`]): a method-dispatch table plus
//!   schema-driven serialization ([`serializer`], [`types`]) and error
//!   classification.
//! - **Contract runtime** ([`contract`]): binds two typed interfaces
//!   (one per peer role) to handler objects and counterpart proxies.
//! - **Reflection** ([`reflection`]): a built-in contract for listing the
//!   peer's registered methods.
//!
//! ## Example
//!
//! ```ignore
//! use peerwire::contract::{ContractBuilder, ContractHandlers};
//! use peerwire::types::request_type;
//! use peerwire::serializer;
//!
//! let mut builder = ContractBuilder::new("calc");
//! let calculate = builder.server_request("calculate", request_type()
//!     .params(serializer::of::<CalcParams>())
//!     .result(serializer::of::<String>())
//!     .build());
//! let contract = builder.build();
//!
//! // Server peer:
//! let handlers = ContractHandlers::new().on_request(&calculate, |p, _info| async move {
//!     Ok(format!("bla{}", p.name))
//! });
//! let (server, _channel) = contract.register_server_over_transport(
//!     transport, handlers, Default::default())?;
//!
//! // Client peer:
//! let (client, _channel) = contract.get_server_over_transport(
//!     peer_transport, ContractHandlers::new(), Default::default())?;
//! let result = client.counterpart.request(&calculate, CalcParams { name: "foo".into() }).await?;
//! ```

pub mod channel;
pub mod contract;
pub mod error;
pub mod logger;
pub mod message;
pub mod reflection;
pub mod serializer;
pub mod transport;
pub mod typed;
pub mod types;

pub use channel::{ChannelHandler, RequestChannel, StreamBasedChannel, StreamChannelFactory};
pub use contract::{Contract, ContractBuilder, ContractHandlers, Counterpart, HandlerInfo};
pub use error::{CallError, ChannelError, ContractError, RegistrationError, StartError, TransportError};
pub use logger::{LogEntry, RpcLogger, TracingLogger};
pub use message::{codes, ErrorObject, Message, RequestId};
pub use transport::{ConnectionState, MessageTransport};
pub use typed::{
    DomainError, HandlerError, MappedChannel, Registration, Registrations, RequestContext,
    TypedChannel, TypedChannelOptions, TypedRpc,
};
pub use types::{notification_type, request_type, NotificationType, RequestType};
