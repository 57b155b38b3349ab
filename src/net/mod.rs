//! Peer networking: admission, registry, routing, dispatch and transports.

pub mod counters;
pub mod dispatcher;
pub mod memory;
pub mod message;
pub mod rate_limit;
pub mod registry;
pub mod routing;
pub mod tcp;
pub mod transport;

pub use counters::{CounterSnapshot, Counters};
pub use dispatcher::{Delivery, DispatchError, Dispatcher, InboundHandler};
pub use memory::{MemoryHub, MemoryTransport};
pub use message::{FrameError, MessageKind, RoutedMessage, WireMessage};
pub use rate_limit::{Admission, RateLimiter, Rejection};
pub use registry::{Connection, PeerObserver, PeerRegistry, RegistryError};
pub use routing::{Route, RoutingTable};
pub use tcp::{spawn_node, NetError, TcpNode, TcpTransport};
pub use transport::{InboundFrame, SendAck, Transport, TransportError};
