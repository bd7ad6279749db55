//! Voxmesh peer mesh
//!
//! Full-mesh voice and video sessions: every participant of a channel or a
//! call keeps one peer link to every other participant and publishes up to
//! four sources over it.
//!
//! ## Architecture
//!
//! - **`SessionCoordinator`**: join/leave, membership reconciliation and the
//!   per-sender inbound signal lanes
//! - **`PeerLink`**: negotiation state machine of one remote participant,
//!   with ICE candidate buffering
//! - **`TrackMultiplexer`**: the local voice, soundpad, screen and camera
//!   slots, fanned out to every link
//! - **`PeerTransport`**: the media stack under a link, either a WebRTC peer
//!   connection or an in-process simulation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use voxmesh_mesh::{Collaborators, SessionCoordinator};
//!
//! let coordinator = SessionCoordinator::new(local_id, &config, collaborators);
//! coordinator.start().await?;
//! coordinator.join_channel(ChannelId::from("42")).await?;
//! coordinator.toggle_camera().await?;
//! coordinator.leave().await;
//! ```

mod coordinator;
mod events;
mod link;
mod multiplexer;
mod rtc;
mod simulated;
mod transport;

pub use coordinator::{Collaborators, SessionCoordinator};
pub use events::{DropReason, RemoteParticipant, SessionEvent, SessionState, SignalOutcome};
pub use link::{CandidateDisposition, LinkStats, NegotiationState, PeerLink};
pub use multiplexer::TrackMultiplexer;
pub use rtc::{WebRtcTransport, WebRtcTransportFactory};
pub use simulated::{SimulatedTransport, SimulatedTransportFactory};
pub use transport::{ConnectionState, PeerTransport, PeerTransportFactory, TransportEvent};
