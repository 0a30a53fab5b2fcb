pub mod batch;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod interpolation;
pub mod latency;
pub mod net;
pub mod prediction;
pub mod rate;
pub mod scheduler;
pub mod session;

pub use batch::{BatchConfig, BatchingQueue, Dispatch, OutboundBatch};
pub use client::SyncClient;
pub use config::{DEFAULT_TICK_RATE, RetryConfig, SyncConfig, TransportConfig};
pub use entity::{EntityHandle, EntityId, ParticipantState, ParticipantStats};
pub use error::{ConnectionError, ProtocolError, TransportError};
pub use event::{DisconnectReason, EventBuffer, SyncEvent};
pub use interpolation::{
    InterpolationConfig, RemoteEntitySnapshot, RemoteInterpolator, RemoteUpdate,
};
pub use latency::{
    LatencyConfig, LatencyEstimate, LatencyMonitor, LatencyThresholds, LatencyTier, LatencyUpdate,
};
pub use net::{
    ClientMessage, LoopbackServer, LoopbackTransport, NetworkStats, PacketLossSimulation,
    ServerMessage, ServerMessageKind, SessionSnapshot, Transport, TransportSession, UdpTransport,
    loopback_pair,
};
pub use prediction::{
    ArenaBounds, Correction, InputState, LocalPrediction, PredictionConfig, PredictionState,
};
pub use rate::{RateConfig, RateController, RateParams};
pub use scheduler::{Scheduler, TimerHandle, TimerTask};
pub use session::{ConnectionState, Session};
