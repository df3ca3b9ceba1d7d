use std::time::Duration;

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::{sync::watch, time::sleep};
use tracing::{info, warn};

use super::source::{PushSource, SessionEnd};
use crate::dispatcher::DepositHandler;

/// Lifecycle of the push subscription. Only the supervisor mutates it.
///
/// `ReconnectScheduled` is the disconnected state with exactly one reconnect
/// pending; further loss events while in it are absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    ReconnectScheduled,
    Connecting,
    Subscribed { subscription: u64 },
    Stopped,
}

impl SubscriptionState {
    fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected | Self::Stopped => 0.0,
            Self::ReconnectScheduled => 1.0,
            Self::Connecting => 2.0,
            Self::Subscribed { .. } => 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connect,
    Ack { subscription: u64 },
    /// Error or close on the connection.
    Lost,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEffect {
    None,
    ScheduleReconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal subscription transition: {event:?} while {state:?}")]
pub struct IllegalTransition {
    pub state: SubscriptionState,
    pub event: LifecycleEvent,
}

impl SubscriptionState {
    pub fn transition(
        self,
        event: LifecycleEvent,
    ) -> Result<(Self, TransitionEffect), IllegalTransition> {
        use LifecycleEvent as E;
        use SubscriptionState as S;

        match (self, event) {
            (S::Disconnected | S::ReconnectScheduled, E::Connect) => {
                Ok((S::Connecting, TransitionEffect::None))
            }
            (S::Connecting, E::Ack { subscription }) => {
                Ok((S::Subscribed { subscription }, TransitionEffect::None))
            }
            (S::Connecting | S::Subscribed { .. }, E::Lost) => {
                Ok((S::ReconnectScheduled, TransitionEffect::ScheduleReconnect))
            }
            (S::Disconnected | S::ReconnectScheduled | S::Stopped, E::Lost) => {
                Ok((self, TransitionEffect::None))
            }
            (_, E::Stop) => Ok((S::Stopped, TransitionEffect::None)),
            (state, event) => Err(IllegalTransition { state, event }),
        }
    }
}

/// Owns the push connection lifecycle: connects, re-subscribes from scratch
/// after any loss, and waits a fixed delay between attempts.
pub struct ReconnectSupervisor {
    state: watch::Sender<SubscriptionState>,
    reconnect_delay: Duration,
}

impl ReconnectSupervisor {
    pub fn new(reconnect_delay: Duration) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Disconnected);
        Self {
            state,
            reconnect_delay,
        }
    }

    /// Observes state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Applies an event; illegal transitions are logged and leave the state
    /// untouched.
    pub fn apply(&self, event: LifecycleEvent) -> TransitionEffect {
        let mut effect = TransitionEffect::None;
        self.state.send_if_modified(|state| match state.transition(event) {
            Ok((next, outcome)) => {
                effect = outcome;
                let changed = *state != next;
                if changed {
                    info!(from = ?*state, to = ?next, "push subscription state changed");
                    gauge!("monitor_push_state").set(next.gauge_value());
                }
                *state = next;
                changed
            }
            Err(err) => {
                warn!(%err, "ignoring subscription event");
                false
            }
        });
        if effect == TransitionEffect::ScheduleReconnect {
            counter!("monitor_push_reconnects_total").increment(1);
        }
        effect
    }

    /// Drives sessions until `shutdown` flips to `true`.
    pub async fn run<H>(self, source: PushSource<H>, mut shutdown: watch::Receiver<bool>)
    where
        H: DepositHandler + 'static,
    {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.apply(LifecycleEvent::Connect);
            match source.run_session(&self, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(err) => {
                    warn!(%err, delay_ms = self.reconnect_delay.as_millis() as u64, "push connection lost");
                    if self.apply(LifecycleEvent::Lost) != TransitionEffect::ScheduleReconnect {
                        continue;
                    }
                    tokio::select! {
                        _ = sleep(self.reconnect_delay) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.apply(LifecycleEvent::Stop);
        info!("push source stopped");
    }
}
