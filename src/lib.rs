pub mod attestation;
pub mod bus;
pub mod engine;
pub mod error;
pub mod frame;
pub mod pool;
pub mod session;
pub mod subscriber;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use error::{EngineError, Error, HandshakeError, Result, SessionError};
pub use frame::{Frame, FrameType};

pub use attestation::types::{PeerId, Phase};
pub use attestation::TrustEngine;

pub use bus::{EventBus, EventBusConfig, EventStream, NewConfidentialTxsEvent, Subscription};
pub use engine::types::{
    Address, ConfidentialTransaction, Hash, Origin, PoolStats, RawTransaction, SendResult,
    TxStatus,
};
pub use engine::{EngineClient, EngineConfig};
pub use pool::{ConfidentialTxPool, PoolConfig};
pub use session::channel::{Message, PeerSession};
pub use session::HandshakeConfig;
pub use subscriber::{
    ProbePolicy, ReconnectingSubscriber, SubscriberConfig, SubscriberState, TxBatchStream, TxFeed,
};

#[cfg(feature = "mock")]
pub use attestation::mock::StaticTrustEngine;
