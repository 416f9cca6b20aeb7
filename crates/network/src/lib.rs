//! # Korelink Networking Layer
//!
//! Tokio-based session and mirror networking for the Korelink agent.
//!
//! ## Modules
//!
//! - [`config`] - Session and mirror configuration
//! - [`descriptor`] - Deterministic server selection per hop
//! - [`milestone`] - Lifecycle milestone detection
//! - [`hooks`] - Synchronous extension points
//! - [`session`] - Upstream session state machine
//! - [`world`] - World state cache and snapshot synthesis
//! - [`mirror`] - Local server for real clients
//! - [`driver`] - The agent tick loop

pub mod config;
pub mod descriptor;
pub mod driver;
pub mod hooks;
pub mod milestone;
pub mod mirror;
pub mod session;
pub mod world;

// Re-export commonly used items
pub use config::{
    InGameDisconnectPolicy, MirrorConfig, SessionConfig, SlotPolicy, StageTimeouts, Topology,
};
pub use descriptor::ServerDescriptor;
pub use driver::{Agent, TickOutcome};
pub use hooks::{Direction, HookEvent, HookOutcome, HookPoint, HookRegistry, SharedHooks};
pub use milestone::{CharacterEntry, Milestone, MilestoneDetector, ServerEntry};
pub use mirror::{
    ClientPhase, Disposition, LocalContext, LocalHandler, MirrorServer, MirroredClientSession,
    SlotKey,
};
pub use session::{
    ChallengeState, DisconnectKind, SessionEvent, SessionIdentity, SessionStateMachine, Stage,
    TrafficStats,
};
pub use world::{ActorInfo, WorldState, STANDARD_STATS};
