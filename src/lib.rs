pub mod config;
pub mod error;
pub mod event;
pub mod id_cache;
pub mod message;
pub mod neighbor;
pub mod node;
pub mod packet;
pub mod queue;
pub mod routing;
pub mod sim;
pub mod time;
pub mod timer;

pub use config::AodvConfig;
pub use error::{ConfigError, DecodeError, ForwardError};
pub use event::Event;
pub use message::{Message, MessageType, RouteError, RouteReply, RouteReplyAck, RouteRequest};
pub use neighbor::{Neighbor, NeighborTracker};
pub use node::{AodvNode, NodeStats};
pub use packet::{AODV_SERVICE_ID, Address, DataPacket, Frame, Transport};
pub use routing::{Route, RouteEntry, RouteState, RoutingTable};
pub use sim::Network;
pub use time::{Clock, ManualClock, SystemClock, Time};
