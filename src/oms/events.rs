use log::debug;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::oms::order::Order;
use crate::risk::RiskAssessment;
use crate::types::{Price, TradeIntent};

const DEFAULT_CAPACITY: usize = 1024;

/// Lifecycle notification published by the order manager
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum OrderEvent {
    #[serde(rename = "order-filled")]
    Filled { order: Order, message: String },
    #[serde(rename = "order-exited")]
    Exited {
        order: Order,
        exit_price: Price,
        pnl: Decimal,
        message: String,
    },
    #[serde(rename = "order-cancelled")]
    Cancelled { order: Order, message: String },
    #[serde(rename = "order-rejected")]
    Rejected { intent: TradeIntent, reason: String },
    #[serde(rename = "order-blocked")]
    Blocked {
        intent: TradeIntent,
        assessment: RiskAssessment,
    },
}

impl OrderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrderEvent::Filled { .. } => "order-filled",
            OrderEvent::Exited { .. } => "order-exited",
            OrderEvent::Cancelled { .. } => "order-cancelled",
            OrderEvent::Rejected { .. } => "order-rejected",
            OrderEvent::Blocked { .. } => "order-blocked",
        }
    }

    /// Instrument the event concerns
    pub fn instrument(&self) -> &str {
        match self {
            OrderEvent::Filled { order, .. }
            | OrderEvent::Exited { order, .. }
            | OrderEvent::Cancelled { order, .. } => order.instrument(),
            OrderEvent::Rejected { intent, .. } | OrderEvent::Blocked { intent, .. } => {
                &intent.instrument
            }
        }
    }
}

/// Publish/subscribe channel for lifecycle events.
///
/// Each subscriber gets its own receiver; publishing never blocks and does
/// not depend on how many subscribers exist.
#[derive(Debug, Clone)]
pub struct OrderEventBus {
    sender: broadcast::Sender<OrderEvent>,
}

impl OrderEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: OrderEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            debug!("No subscribers for {}", name);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for OrderEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, OptionType};
    use rust_decimal_macros::dec;

    fn intent() -> TradeIntent {
        TradeIntent::new(
            "NIFTY",
            Direction::Bearish,
            OptionType::Put,
            Price::new(dec!(50)),
            Price::new(dec!(57.5)),
            Price::new(dec!(42.5)),
            70.0,
        )
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_events() {
        let bus = OrderEventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(OrderEvent::Rejected {
            intent: intent(),
            reason: "insufficient margin".to_string(),
        });

        assert_eq!(first.recv().await.unwrap().name(), "order-rejected");
        assert_eq!(second.recv().await.unwrap().instrument(), "NIFTY");
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let bus = OrderEventBus::default();
        bus.publish(OrderEvent::Rejected {
            intent: intent(),
            reason: "closed".to_string(),
        });
    }

    #[test]
    fn test_event_serializes_with_name_tag() {
        let event = OrderEvent::Rejected {
            intent: intent(),
            reason: "closed".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "order-rejected");
    }
}
