//! Per-order lifecycle state machine.
//!
//! The machine is the authoritative source of an order's status. Every
//! applied transition is appended to the `order_events` log *before* the
//! in-memory state moves, so replaying the log reconstructs the current
//! state after a crash.

use hedgerow_core::{Order, OrderStatus, Size, VenueOrderId};
use rust_decimal::Decimal;
use serde_json::json;

/// Events driving the machine. Nothing else mutates an order's status.
#[derive(Clone, Debug, PartialEq)]
pub enum OrderEvent {
    /// The manager handed the order to the venue adapter.
    PlaceSubmitted,
    PlaceAcked { venue_order_id: VenueOrderId },
    PlaceRejected { reason: String },
    FillReceived { size: Size },
    CancelRequested,
    CancelAcked,
    CancelRejected { reason: String },
    TimeoutElapsed,
    ErrorObserved { reason: String },
}

impl OrderEvent {
    /// Stage name recorded in the event log.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::PlaceSubmitted => "place_submitted",
            Self::PlaceAcked { .. } => "place_acked",
            Self::PlaceRejected { .. } => "place_rejected",
            Self::FillReceived { .. } => "fill_received",
            Self::CancelRequested => "cancel_requested",
            Self::CancelAcked => "cancel_acked",
            Self::CancelRejected { .. } => "cancel_rejected",
            Self::TimeoutElapsed => "timeout_elapsed",
            Self::ErrorObserved { .. } => "error_observed",
        }
    }

    /// Structured payload stored alongside the stage.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::PlaceAcked { venue_order_id } => json!({ "venue_order_id": venue_order_id }),
            Self::PlaceRejected { reason }
            | Self::CancelRejected { reason }
            | Self::ErrorObserved { reason } => json!({ "reason": reason }),
            Self::FillReceived { size } => json!({ "size": size.to_string() }),
            _ => json!({}),
        }
    }

    /// Rebuild an event from a persisted log row. `None` for foreign stages
    /// (the log also carries non-transition entries such as hedge summaries).
    #[must_use]
    pub fn from_stage(stage: &str, payload: &serde_json::Value) -> Option<Self> {
        let reason = || {
            payload
                .get("reason")
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string()
        };
        match stage {
            "place_submitted" => Some(Self::PlaceSubmitted),
            "place_acked" => Some(Self::PlaceAcked {
                venue_order_id: payload
                    .get("venue_order_id")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
            "place_rejected" => Some(Self::PlaceRejected { reason: reason() }),
            "fill_received" => {
                let size = payload
                    .get("size")
                    .and_then(|value| value.as_str())
                    .and_then(|raw| raw.parse().ok())?;
                Some(Self::FillReceived { size })
            }
            "cancel_requested" => Some(Self::CancelRequested),
            "cancel_acked" => Some(Self::CancelAcked),
            "cancel_rejected" => Some(Self::CancelRejected { reason: reason() }),
            "timeout_elapsed" => Some(Self::TimeoutElapsed),
            "error_observed" => Some(Self::ErrorObserved { reason: reason() }),
            _ => None,
        }
    }
}

/// What a prospective event would do to the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Legal; [`OrderFsm::apply`] will move to this status.
    Apply(OrderStatus),
    /// A late ack on an already-terminal order; dropped without noise.
    Discard,
    /// Not legal from the current state; caller records an incident.
    Illegal,
}

/// The state machine wrapping one [`Order`]. One instance per order,
/// addressable by client order id, serialized by the manager's per-order
/// lock.
#[derive(Debug)]
pub struct OrderFsm {
    order: Order,
}

impl OrderFsm {
    #[must_use]
    pub fn new(order: Order) -> Self {
        Self { order }
    }

    #[must_use]
    pub fn order(&self) -> &Order {
        &self.order
    }

    #[must_use]
    pub fn status(&self) -> OrderStatus {
        self.order.status
    }

    /// Compute the effect of `event` without applying it.
    #[must_use]
    pub fn next(&self, event: &OrderEvent) -> Transition {
        use OrderEvent as E;
        use OrderStatus as S;
        let current = self.order.status;
        if current.is_terminal() {
            // A cancel ack racing a completing fill loses quietly.
            return if matches!(event, E::CancelAcked) && current == S::Filled {
                Transition::Discard
            } else {
                Transition::Illegal
            };
        }
        match (current, event) {
            (S::New, E::PlaceSubmitted) => Transition::Apply(S::PendingPlace),
            (S::New, E::PlaceRejected { .. }) => Transition::Apply(S::Rejected),
            (S::New, E::ErrorObserved { .. }) => Transition::Apply(S::Errored),
            (S::PendingPlace, E::PlaceAcked { .. }) => Transition::Apply(S::Live),
            (S::PendingPlace, E::PlaceRejected { .. }) => Transition::Apply(S::Rejected),
            (S::PendingPlace, E::ErrorObserved { .. }) => Transition::Apply(S::Errored),
            (S::Live | S::Partial, E::FillReceived { size }) => {
                Transition::Apply(self.status_after_fill(*size, S::Partial))
            }
            (S::Live | S::Partial, E::CancelRequested) => Transition::Apply(S::Cancelling),
            (S::Live | S::Partial, E::TimeoutElapsed) => Transition::Apply(S::Expired),
            (S::Live | S::Partial, E::ErrorObserved { .. }) => Transition::Apply(S::Errored),
            (S::Cancelling, E::FillReceived { size }) => {
                // A fill completing the order beats the cancel.
                Transition::Apply(self.status_after_fill(*size, S::Cancelling))
            }
            (S::Cancelling, E::CancelAcked) => Transition::Apply(S::Cancelled),
            (S::Cancelling, E::CancelRejected { .. }) => Transition::Apply(S::Errored),
            (S::Cancelling, E::ErrorObserved { .. }) => Transition::Apply(S::Errored),
            _ => Transition::Illegal,
        }
    }

    fn status_after_fill(&self, size: Size, partial_status: OrderStatus) -> OrderStatus {
        let filled = (self.order.filled_size + size).min(self.order.requested_size);
        if filled >= self.order.requested_size {
            OrderStatus::Filled
        } else {
            partial_status
        }
    }

    /// Apply a previously vetted event. Returns the transition that took
    /// place; illegal events leave the order untouched.
    pub fn apply(&mut self, event: &OrderEvent) -> Transition {
        let transition = self.next(event);
        let Transition::Apply(next_status) = transition else {
            return transition;
        };
        match event {
            OrderEvent::PlaceAcked { venue_order_id } => {
                self.order.venue_order_id = Some(venue_order_id.clone());
            }
            OrderEvent::FillReceived { size } => {
                self.order.filled_size =
                    (self.order.filled_size + *size).min(self.order.requested_size);
            }
            _ => {}
        }
        self.order.status = next_status;
        self.order.updated_at = chrono::Utc::now();
        transition
    }

    /// Rebuild the machine by replaying a persisted event log over a fresh
    /// `NEW` order. Foreign stages and events illegal at their position are
    /// skipped, mirroring how they were skipped when first observed.
    #[must_use]
    pub fn replay(mut order: Order, events: impl IntoIterator<Item = OrderEvent>) -> Self {
        order.status = OrderStatus::New;
        order.filled_size = Decimal::ZERO;
        order.venue_order_id = None;
        let mut fsm = Self::new(order);
        for event in events {
            fsm.apply(&event);
        }
        fsm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hedgerow_core::{OrderRole, OrderSpec, OrderType, Side, Venue};
    use rust_decimal_macros::dec;

    fn fsm(size: Decimal) -> OrderFsm {
        let spec = OrderSpec {
            venue: Venue::new("polymarket"),
            account_id: "acct".into(),
            market_id: "mkt".into(),
            pair_id: "ev-1".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Some(dec!(0.42)),
            size,
            time_in_force: None,
            role: OrderRole::Primary,
            parent_fill_id: None,
        };
        OrderFsm::new(Order::from_spec(&spec, "cid-1".into(), false))
    }

    fn drive(fsm: &mut OrderFsm, events: &[OrderEvent]) {
        for event in events {
            assert!(
                matches!(fsm.apply(event), Transition::Apply(_)),
                "event {event:?} should be legal from {:?}",
                fsm.status()
            );
        }
    }

    #[test]
    fn happy_path_reaches_filled() {
        let mut fsm = fsm(dec!(100));
        drive(
            &mut fsm,
            &[
                OrderEvent::PlaceSubmitted,
                OrderEvent::PlaceAcked {
                    venue_order_id: "v-1".into(),
                },
                OrderEvent::FillReceived { size: dec!(40) },
                OrderEvent::FillReceived { size: dec!(60) },
            ],
        );
        assert_eq!(fsm.status(), OrderStatus::Filled);
        assert_eq!(fsm.order().filled_size, dec!(100));
        assert_eq!(fsm.order().venue_order_id.as_deref(), Some("v-1"));
    }

    #[test]
    fn partial_fill_is_not_terminal() {
        let mut fsm = fsm(dec!(100));
        drive(
            &mut fsm,
            &[
                OrderEvent::PlaceSubmitted,
                OrderEvent::PlaceAcked {
                    venue_order_id: "v-1".into(),
                },
                OrderEvent::FillReceived { size: dec!(30) },
            ],
        );
        assert_eq!(fsm.status(), OrderStatus::Partial);
        assert_eq!(fsm.order().remaining_size(), dec!(70));
    }

    #[test]
    fn fill_completing_the_order_beats_a_pending_cancel() {
        let mut fsm = fsm(dec!(100));
        drive(
            &mut fsm,
            &[
                OrderEvent::PlaceSubmitted,
                OrderEvent::PlaceAcked {
                    venue_order_id: "v-1".into(),
                },
                OrderEvent::FillReceived { size: dec!(60) },
                OrderEvent::CancelRequested,
                OrderEvent::FillReceived { size: dec!(40) },
            ],
        );
        assert_eq!(fsm.status(), OrderStatus::Filled);
        // The late ack from the venue is discarded, not an incident.
        assert_eq!(fsm.apply(&OrderEvent::CancelAcked), Transition::Discard);
        assert_eq!(fsm.status(), OrderStatus::Filled);
    }

    #[test]
    fn partial_fill_during_cancelling_stays_cancelling() {
        let mut fsm = fsm(dec!(100));
        drive(
            &mut fsm,
            &[
                OrderEvent::PlaceSubmitted,
                OrderEvent::PlaceAcked {
                    venue_order_id: "v-1".into(),
                },
                OrderEvent::CancelRequested,
                OrderEvent::FillReceived { size: dec!(10) },
                OrderEvent::CancelAcked,
            ],
        );
        assert_eq!(fsm.status(), OrderStatus::Cancelled);
        assert_eq!(fsm.order().filled_size, dec!(10));
    }

    #[test]
    fn rejection_is_terminal() {
        let mut fsm = fsm(dec!(100));
        drive(
            &mut fsm,
            &[
                OrderEvent::PlaceSubmitted,
                OrderEvent::PlaceRejected {
                    reason: "insufficient balance".into(),
                },
            ],
        );
        assert_eq!(fsm.status(), OrderStatus::Rejected);
        assert_eq!(
            fsm.apply(&OrderEvent::FillReceived { size: dec!(1) }),
            Transition::Illegal
        );
        assert_eq!(fsm.status(), OrderStatus::Rejected);
    }

    #[test]
    fn timeout_expires_resting_orders() {
        let mut fsm = fsm(dec!(100));
        drive(
            &mut fsm,
            &[
                OrderEvent::PlaceSubmitted,
                OrderEvent::PlaceAcked {
                    venue_order_id: "v-1".into(),
                },
                OrderEvent::TimeoutElapsed,
            ],
        );
        assert_eq!(fsm.status(), OrderStatus::Expired);
    }

    #[test]
    fn illegal_events_do_not_mutate() {
        let mut fsm = fsm(dec!(100));
        assert_eq!(fsm.apply(&OrderEvent::CancelAcked), Transition::Illegal);
        assert_eq!(fsm.status(), OrderStatus::New);
        assert_eq!(
            fsm.apply(&OrderEvent::FillReceived { size: dec!(10) }),
            Transition::Illegal
        );
        assert_eq!(fsm.order().filled_size, Decimal::ZERO);
    }

    #[test]
    fn overfill_is_clamped_to_requested_size() {
        let mut fsm = fsm(dec!(100));
        drive(
            &mut fsm,
            &[
                OrderEvent::PlaceSubmitted,
                OrderEvent::PlaceAcked {
                    venue_order_id: "v-1".into(),
                },
                OrderEvent::FillReceived { size: dec!(150) },
            ],
        );
        assert_eq!(fsm.status(), OrderStatus::Filled);
        assert_eq!(fsm.order().filled_size, dec!(100));
    }

    #[test]
    fn replaying_the_event_log_reconstructs_state() {
        let mut fsm = fsm(dec!(100));
        let events = vec![
            OrderEvent::PlaceSubmitted,
            OrderEvent::PlaceAcked {
                venue_order_id: "v-1".into(),
            },
            OrderEvent::FillReceived { size: dec!(30) },
            OrderEvent::CancelRequested,
            OrderEvent::CancelAcked,
        ];
        for event in &events {
            fsm.apply(event);
        }
        let replayed = OrderFsm::replay(fsm.order().clone(), events);
        assert_eq!(replayed.status(), fsm.status());
        assert_eq!(replayed.order().filled_size, fsm.order().filled_size);
        assert_eq!(
            replayed.order().venue_order_id,
            fsm.order().venue_order_id
        );
    }

    #[test]
    fn events_round_trip_through_log_rows() {
        let events = vec![
            OrderEvent::PlaceSubmitted,
            OrderEvent::PlaceAcked {
                venue_order_id: "v-9".into(),
            },
            OrderEvent::FillReceived { size: dec!(12.5) },
            OrderEvent::ErrorObserved {
                reason: "socket closed".into(),
            },
        ];
        for event in events {
            let rebuilt = OrderEvent::from_stage(event.stage(), &event.payload()).unwrap();
            assert_eq!(rebuilt, event);
        }
        assert!(OrderEvent::from_stage("hedge", &json!({})).is_none());
    }

    #[test]
    fn at_most_one_terminal_transition() {
        // Walk a full lifecycle and count terminal transitions.
        let mut fsm = fsm(dec!(100));
        let events = [
            OrderEvent::PlaceSubmitted,
            OrderEvent::PlaceAcked {
                venue_order_id: "v-1".into(),
            },
            OrderEvent::FillReceived { size: dec!(100) },
            OrderEvent::CancelRequested,
            OrderEvent::CancelAcked,
            OrderEvent::ErrorObserved {
                reason: "late".into(),
            },
        ];
        let mut terminal_transitions = 0;
        for event in &events {
            if let Transition::Apply(status) = fsm.apply(event) {
                if status.is_terminal() {
                    terminal_transitions += 1;
                }
            }
        }
        assert_eq!(terminal_transitions, 1);
    }
}
