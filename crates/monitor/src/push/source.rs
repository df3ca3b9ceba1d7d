use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use claimwatch_domain::model::Address;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::{
    sync::watch,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{
    parse_inbound, subscribe_request,
    supervisor::{LifecycleEvent, ReconnectSupervisor},
    Inbound, PushError,
};
use crate::{
    dispatcher::{CandidateSource, DepositHandler, Dispatcher},
    extractor::extract,
};

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    Shutdown,
    Lost(PushError),
}

/// Reader side of the push subscription. One session is one connection; the
/// supervisor decides when to start the next.
pub struct PushSource<H> {
    ws_url: String,
    address: Address,
    commitment: String,
    ping_interval: Duration,
    dispatcher: Dispatcher<H>,
    next_request_id: AtomicU64,
}

impl<H> PushSource<H>
where
    H: DepositHandler + 'static,
{
    pub fn new(
        ws_url: impl Into<String>,
        address: Address,
        commitment: impl Into<String>,
        ping_interval: Duration,
        dispatcher: Dispatcher<H>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            address,
            commitment: commitment.into(),
            ping_interval: ping_interval.max(Duration::from_millis(100)),
            dispatcher,
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Connects, subscribes and feeds notifications to the dispatcher until the
    /// connection fails or closes, or `shutdown` flips. A connection with no
    /// inbound frame, pongs included, for two ping intervals counts as lost.
    pub async fn run_session(
        &self,
        lifecycle: &ReconnectSupervisor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        info!(url = %self.ws_url, address = %self.address, "connecting push source");
        let connected = tokio::select! {
            result = connect_async(self.ws_url.as_str()) => result,
            _ = shutdown.changed() => return SessionEnd::Shutdown,
        };
        let stream = match connected {
            Ok((stream, _)) => stream,
            Err(err) => return SessionEnd::Lost(err.into()),
        };
        let (mut write, mut read) = stream.split();

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = subscribe_request(request_id, &self.address, &self.commitment);
        let payload = match serde_json::to_string(&request) {
            Ok(payload) => payload,
            Err(err) => return SessionEnd::Lost(PushError::Closed(err.to_string())),
        };
        if let Err(err) = write.send(Message::Text(payload)).await {
            return SessionEnd::Lost(err.into());
        }
        debug!(request_id, "subscription request sent");

        let mut keepalive = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let idle_limit = self.ping_interval * 2;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                _ = keepalive.tick() => {
                    let idle = last_inbound.elapsed();
                    if idle >= idle_limit {
                        warn!(idle_ms = idle.as_millis() as u64, "push connection went silent");
                        return SessionEnd::Lost(PushError::Closed(format!(
                            "no frames for {}ms",
                            idle.as_millis()
                        )));
                    }
                    if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                        return SessionEnd::Lost(err.into());
                    }
                }
                frame = read.next() => {
                    let message = match frame {
                        Some(Ok(message)) => {
                            last_inbound = Instant::now();
                            message
                        }
                        Some(Err(err)) => return SessionEnd::Lost(err.into()),
                        None => return SessionEnd::Lost(PushError::Closed("stream ended".into())),
                    };
                    match message {
                        Message::Text(text) => {
                            if let Err(err) = self.handle_text(&text, request_id, lifecycle) {
                                return SessionEnd::Lost(err);
                            }
                        }
                        Message::Binary(bytes) => match String::from_utf8(bytes) {
                            Ok(text) => {
                                if let Err(err) = self.handle_text(&text, request_id, lifecycle) {
                                    return SessionEnd::Lost(err);
                                }
                            }
                            Err(_) => warn!("dropping non-utf8 binary frame"),
                        },
                        Message::Ping(data) => {
                            if let Err(err) = write.send(Message::Pong(data)).await {
                                return SessionEnd::Lost(err.into());
                            }
                        }
                        Message::Close(frame) => {
                            let reason = frame
                                .map(|frame| frame.reason.into_owned())
                                .filter(|reason| !reason.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string());
                            return SessionEnd::Lost(PushError::Closed(reason));
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    /// Handles one text frame. Only a rejected subscription ends the session;
    /// malformed frames are logged and dropped.
    fn handle_text(
        &self,
        text: &str,
        request_id: u64,
        lifecycle: &ReconnectSupervisor,
    ) -> Result<(), PushError> {
        match parse_inbound(text) {
            Ok(Inbound::Ack { id, subscription }) if id == request_id => {
                info!(subscription, "push subscription active");
                lifecycle.apply(LifecycleEvent::Ack { subscription });
            }
            Ok(Inbound::Rejected { id, error }) if id == request_id => {
                return Err(PushError::SubscriptionRejected(error));
            }
            Ok(Inbound::Notification { transaction, .. }) => {
                counter!("monitor_push_notifications_total", "result" => "ok").increment(1);
                let candidate = extract(&transaction, &self.address);
                self.dispatcher.on_candidate(candidate, CandidateSource::Push);
            }
            Ok(_) => {}
            Err(err) => {
                counter!("monitor_push_notifications_total", "result" => "malformed").increment(1);
                warn!(%err, "dropping malformed push message");
            }
        }
        Ok(())
    }
}
