//! Realtime event gateway: websocket clients subscribe to generation jobs
//! and receive their persisted history followed by live bus events.

pub mod admission;
pub mod bus;
pub mod config;
pub mod connection;
pub mod gateway;
pub mod idle;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod replay;
pub mod server;
pub mod shutdown;
pub mod socket;
pub mod subscriptions;

pub use bus::{BusRecv, BusSource, LocalBus, LocalBusReceiver};
pub use config::{ConfigError, GatewayConfig};
pub use connection::{ClientConnection, Delivery, OutboundFrame, OutboundRx};
pub use gateway::{CloseReason, Gateway, GatewayTasks};
pub use metrics::GatewaySnapshot;
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{GatewayRegistry, Limits};
pub use relay::{BusRelay, RelayOutcome};
pub use replay::CatchUpReplayer;
pub use server::{build_router, listen, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use subscriptions::SubscribeOutcome;
