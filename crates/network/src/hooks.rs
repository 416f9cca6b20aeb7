//! # Hook Registry
//!
//! Synchronous observer surface for the agent's extension points.
//!
//! # Architecture
//!
//! Hooks are registered once at startup per [`HookPoint`] and invoked in
//! registration order within the tick that produced the event. A hook
//! returns a [`HookOutcome`]:
//!
//! - `Continue` - let the event proceed
//! - `Override(frame)` - replace the frame about to be sent; later hooks see
//!   the replacement
//! - `Cancel` - drop the frame; no later hook runs
//!
//! # Thread Safety
//!
//! The registry is shared as [`SharedHooks`] and locked only for the duration
//! of one dispatch. Hooks must not call back into the agent.
//!
//! # Example
//!
//! ```no_run
//! use korelink_network::{HookEvent, HookOutcome, HookPoint, HookRegistry};
//! use korelink_protocol::message_ids;
//!
//! let mut hooks = HookRegistry::new();
//! hooks.register(HookPoint::SendingFrame, |event| match event {
//!     HookEvent::SendingFrame { frame, .. } if frame.id == message_ids::PUBLIC_CHAT => {
//!         HookOutcome::Cancel
//!     }
//!     _ => HookOutcome::Continue,
//! });
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use korelink_core::ClientId;
use korelink_protocol::Frame;

use crate::milestone::Milestone;
use crate::session::Stage;

/// Where a frame is going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upstream,
    Client(ClientId),
}

/// Extension points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    SendingFrame,
    StageChanged,
    Disconnected,
    MilestoneReached,
    MirrorClientAccepted,
    MirrorClientClosed,
}

/// Event passed to hooks
#[derive(Debug)]
pub enum HookEvent<'a> {
    /// A frame is about to be written (before its identifier is ciphered)
    SendingFrame { direction: Direction, frame: &'a Frame },
    StageChanged { from: Stage, to: Stage },
    Disconnected { reason: &'a str },
    MilestoneReached(&'a Milestone),
    MirrorClientAccepted { client: ClientId, peer: SocketAddr },
    MirrorClientClosed { client: ClientId, reason: &'a str },
}

impl HookEvent<'_> {
    pub fn point(&self) -> HookPoint {
        match self {
            Self::SendingFrame { .. } => HookPoint::SendingFrame,
            Self::StageChanged { .. } => HookPoint::StageChanged,
            Self::Disconnected { .. } => HookPoint::Disconnected,
            Self::MilestoneReached(_) => HookPoint::MilestoneReached,
            Self::MirrorClientAccepted { .. } => HookPoint::MirrorClientAccepted,
            Self::MirrorClientClosed { .. } => HookPoint::MirrorClientClosed,
        }
    }
}

/// What a hook wants to happen next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    Override(Frame),
    Cancel,
}

pub type HookFunction = Box<dyn FnMut(&HookEvent<'_>) -> HookOutcome + Send>;

/// Hooks per extension point, in registration order
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<HookPoint, Vec<HookFunction>>,
}

pub type SharedHooks = Arc<parking_lot::Mutex<HookRegistry>>;

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedHooks {
        Arc::new(parking_lot::Mutex::new(Self::new()))
    }

    /// Register a hook for `point`
    pub fn register<F>(&mut self, point: HookPoint, hook: F)
    where
        F: FnMut(&HookEvent<'_>) -> HookOutcome + Send + 'static,
    {
        tracing::debug!("Registered hook for {:?}", point);
        self.hooks.entry(point).or_default().push(Box::new(hook));
    }

    pub fn hook_count(&self, point: HookPoint) -> usize {
        self.hooks.get(&point).map(Vec::len).unwrap_or(0)
    }

    /// Notify hooks of an event; returns `Cancel` if any hook cancelled
    pub fn dispatch(&mut self, event: &HookEvent<'_>) -> HookOutcome {
        let Some(hooks) = self.hooks.get_mut(&event.point()) else {
            return HookOutcome::Continue;
        };
        for hook in hooks.iter_mut() {
            if hook(event) == HookOutcome::Cancel {
                return HookOutcome::Cancel;
            }
        }
        HookOutcome::Continue
    }

    /// Run the sending hooks over `frame`
    ///
    /// Returns the frame to transmit, or `None` if a hook cancelled it.
    pub fn before_send(&mut self, direction: Direction, frame: Frame) -> Option<Frame> {
        let Some(hooks) = self.hooks.get_mut(&HookPoint::SendingFrame) else {
            return Some(frame);
        };
        let mut current = frame;
        for hook in hooks.iter_mut() {
            let outcome = hook(&HookEvent::SendingFrame {
                direction,
                frame: &current,
            });
            match outcome {
                HookOutcome::Continue => {}
                HookOutcome::Override(replacement) => current = replacement,
                HookOutcome::Cancel => return None,
            }
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use korelink_core::MessageId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_no_hooks_passes_frame() {
        let mut hooks = HookRegistry::new();
        let frame = Frame::empty(MessageId(0x007D));
        assert_eq!(hooks.before_send(Direction::Upstream, frame.clone()), Some(frame));
    }

    #[test]
    fn test_override_is_seen_by_later_hooks() {
        let mut hooks = HookRegistry::new();
        hooks.register(HookPoint::SendingFrame, |_| {
            HookOutcome::Override(Frame::new(MessageId(0x007E), vec![0, 0, 0, 0]))
        });
        hooks.register(HookPoint::SendingFrame, |event| match event {
            HookEvent::SendingFrame { frame, .. } => {
                assert_eq!(frame.id, MessageId(0x007E));
                HookOutcome::Continue
            }
            _ => HookOutcome::Continue,
        });

        let sent = hooks
            .before_send(Direction::Upstream, Frame::empty(MessageId(0x007D)))
            .unwrap();
        assert_eq!(sent.id, MessageId(0x007E));
    }

    #[test]
    fn test_first_cancel_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = HookRegistry::new();
        hooks.register(HookPoint::SendingFrame, |_| HookOutcome::Cancel);
        let counter = calls.clone();
        hooks.register(HookPoint::SendingFrame, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            HookOutcome::Continue
        });

        let sent = hooks.before_send(Direction::Client(ClientId(1)), Frame::empty(MessageId(0x007D)));
        assert!(sent.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.hook_count(HookPoint::SendingFrame), 2);
    }

    #[test]
    fn test_dispatch_runs_in_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut hooks = HookRegistry::new();
        for n in 0..3 {
            let order = order.clone();
            hooks.register(HookPoint::StageChanged, move |_| {
                order.lock().push(n);
                HookOutcome::Continue
            });
        }

        let outcome = hooks.dispatch(&HookEvent::StageChanged {
            from: Stage::Disconnected,
            to: Stage::ConnectedMaster,
        });
        assert_eq!(outcome, HookOutcome::Continue);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
