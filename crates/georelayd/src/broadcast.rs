//! Proximity-bounded fan-out of location updates.
//!
//! The relay payload is serialized once and the same `Arc<String>` is
//! queued on every recipient's outbound channel. Delivery never waits:
//! a recipient whose queue is full simply misses this update, and one
//! whose writer has gone away is reported back for teardown.

use std::sync::Arc;

use georelay_core::{ClientId, Position};
use georelay_protocol::LocationRelay;
use tracing::{debug, error};

use crate::registry::{ConnectionId, ConnectionRegistry, Delivery, Outbound, Visit};

/// Counters from one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Recipients farther than the broadcast radius.
    pub out_of_range: usize,
    /// Recipients with no known position.
    pub unpositioned: usize,
    /// Recipients whose outbound queue was full.
    pub dropped: usize,
    /// Recipients found closed; the caller tears these down.
    pub closed: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Copy)]
pub struct BroadcastDispatcher {
    radius_m: f64,
}

impl BroadcastDispatcher {
    pub fn new(radius_m: f64) -> Self {
        Self { radius_m }
    }

    /// Sends `relay` to every registered client within the radius of
    /// `origin`, except `sender`.
    ///
    /// A recipient exactly at the radius receives the update.
    pub fn dispatch(
        &self,
        sender: &ClientId,
        origin: Position,
        relay: &LocationRelay,
        registry: &ConnectionRegistry,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        let payload = match relay.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                error!(client_id = %sender, error = %e, "Failed to serialize location relay");
                return report;
            }
        };

        let closed = registry.for_each(|recipient, handle| {
            if &recipient.id == sender {
                return Visit::Continue;
            }
            if handle.is_closed() {
                return Visit::Remove;
            }
            let Some(position) = recipient.position else {
                report.unpositioned += 1;
                return Visit::Continue;
            };
            if origin.distance_to(&position) > self.radius_m {
                report.out_of_range += 1;
                return Visit::Continue;
            }

            match handle.try_deliver(Outbound::Text(Arc::clone(&payload))) {
                Delivery::Delivered => {
                    report.delivered += 1;
                    Visit::Continue
                }
                Delivery::Full => {
                    debug!(
                        client_id = %sender,
                        recipient = %recipient.id,
                        "Recipient queue full, dropping relay"
                    );
                    report.dropped += 1;
                    Visit::Continue
                }
                Delivery::Closed => Visit::Remove,
            }
        });
        report.closed = closed;

        debug!(
            client_id = %sender,
            delivered = report.delivered,
            out_of_range = report.out_of_range,
            dropped = report.dropped,
            closed = report.closed.len(),
            "Location relayed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use georelay_core::{Role, EARTH_RADIUS_M};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use crate::registry::{Client, ConnectionHandle};

    const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

    fn origin() -> Position {
        Position::new(37.7749, -122.4194).unwrap()
    }

    fn north_of(meters: f64) -> Position {
        Position::new(origin().lat + meters / METERS_PER_DEGREE, origin().lng).unwrap()
    }

    struct Fixture {
        registry: ConnectionRegistry,
        next: u64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: ConnectionRegistry::new(),
                next: 1,
            }
        }

        fn add(&mut self, id: &str, position: Option<Position>, buffer: usize) -> mpsc::Receiver<Outbound> {
            let (handle, rx) = ConnectionHandle::channel(buffer);
            let conn = ConnectionId::new(self.next);
            self.next += 1;
            self.registry.open(conn, handle, Instant::now());
            self.registry
                .register(Client::new(ClientId::new(id), Role::Rider, position, conn, Instant::now()))
                .unwrap();
            rx
        }
    }

    fn relay_from(id: &str) -> LocationRelay {
        LocationRelay::new(ClientId::new(id), origin(), Role::DriverCandidate)
    }

    #[tokio::test]
    async fn test_delivers_within_radius_only() {
        let mut fx = Fixture::new();
        let mut sender_rx = fx.add("s", Some(origin()), 4);
        let mut near_rx = fx.add("near", Some(north_of(700.0)), 4);
        let mut far_rx = fx.add("far", Some(north_of(800.0)), 4);

        let report = BroadcastDispatcher::new(750.0).dispatch(
            &ClientId::new("s"),
            origin(),
            &relay_from("s"),
            &fx.registry,
        );

        assert_eq!(report.delivered, 1);
        assert_eq!(report.out_of_range, 1);
        assert!(report.closed.is_empty());

        match near_rx.try_recv().unwrap() {
            Outbound::Text(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value["id"], "s");
                assert_eq!(value["type"], "taxi");
            }
            other => panic!("Expected text, got {other:?}"),
        }
        assert!(far_rx.try_recv().is_err());
        assert!(sender_rx.try_recv().is_err(), "sender must not receive its own update");
    }

    #[tokio::test]
    async fn test_radius_is_inclusive() {
        let mut fx = Fixture::new();
        fx.add("s", Some(origin()), 4);
        let mut rx = fx.add("edge", Some(north_of(750.0)), 4);

        // Use the exact computed distance as the radius.
        let radius = origin().distance_to(&north_of(750.0));
        let report = BroadcastDispatcher::new(radius).dispatch(
            &ClientId::new("s"),
            origin(),
            &relay_from("s"),
            &fx.registry,
        );
        assert_eq!(report.delivered, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_skips_recipients_without_position() {
        let mut fx = Fixture::new();
        fx.add("s", Some(origin()), 4);
        let mut rx = fx.add("fresh", None, 4);

        let report = BroadcastDispatcher::new(750.0).dispatch(
            &ClientId::new("s"),
            origin(),
            &relay_from("s"),
            &fx.registry,
        );
        assert_eq!(report.unpositioned, 1);
        assert_eq!(report.delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let mut fx = Fixture::new();
        fx.add("s", Some(origin()), 4);
        let _slow_rx = fx.add("slow", Some(origin()), 1);
        let dispatcher = BroadcastDispatcher::new(750.0);

        let first = dispatcher.dispatch(&ClientId::new("s"), origin(), &relay_from("s"), &fx.registry);
        let second = dispatcher.dispatch(&ClientId::new("s"), origin(), &relay_from("s"), &fx.registry);

        assert_eq!(first.delivered, 1);
        assert_eq!(second.dropped, 1);
        assert!(second.closed.is_empty());
    }

    #[tokio::test]
    async fn test_closed_recipient_is_reported() {
        let mut fx = Fixture::new();
        fx.add("s", Some(origin()), 4);
        let gone_rx = fx.add("gone", Some(origin()), 4);
        let mut ok_rx = fx.add("ok", Some(origin()), 4);
        drop(gone_rx);

        let report = BroadcastDispatcher::new(750.0).dispatch(
            &ClientId::new("s"),
            origin(),
            &relay_from("s"),
            &fx.registry,
        );
        assert_eq!(report.delivered, 1);
        assert_eq!(report.closed, vec![ConnectionId::new(2)]);
        assert!(ok_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_payload_is_shared() {
        let mut fx = Fixture::new();
        fx.add("s", Some(origin()), 4);
        let mut a = fx.add("a", Some(origin()), 4);
        let mut b = fx.add("b", Some(origin()), 4);

        BroadcastDispatcher::new(750.0).dispatch(
            &ClientId::new("s"),
            origin(),
            &relay_from("s"),
            &fx.registry,
        );

        match (a.try_recv().unwrap(), b.try_recv().unwrap()) {
            (Outbound::Text(x), Outbound::Text(y)) => assert!(Arc::ptr_eq(&x, &y)),
            other => panic!("Expected two text frames, got {other:?}"),
        }
    }
}
