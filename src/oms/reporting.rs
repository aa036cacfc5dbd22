use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::oms::manager::OrderLifecycleManager;
use crate::oms::order::{Order, OrderState};
use crate::types::{ExecutionMode, Price};

/// Realized statistics for the current trading day
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyStats {
    pub trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Closed at exactly zero P&L
    pub scratches: usize,
    /// Wins over decided (non-scratch) trades
    pub win_rate: f64,
    pub realized_pnl: Decimal,
    /// Largest peak-to-trough fall of cumulative realized P&L, positive
    pub max_drawdown: Decimal,
    pub open_orders: usize,
}

impl DailyStats {
    /// Build from exited orders, in any order
    pub fn from_exits<'a>(exits: impl Iterator<Item = &'a Order>, open_orders: usize) -> Self {
        let mut closed: Vec<(DateTime<Utc>, Decimal)> = exits
            .filter_map(|order| order.exit.as_ref())
            .map(|exit| (exit.time, exit.pnl))
            .collect();
        closed.sort_by_key(|(time, _)| *time);

        let mut stats = DailyStats {
            open_orders,
            ..Default::default()
        };
        let mut peak = Decimal::ZERO;
        for (_, pnl) in &closed {
            stats.trades += 1;
            if *pnl > Decimal::ZERO {
                stats.wins += 1;
            } else if *pnl < Decimal::ZERO {
                stats.losses += 1;
            } else {
                stats.scratches += 1;
            }
            stats.realized_pnl += *pnl;
            peak = peak.max(stats.realized_pnl);
            stats.max_drawdown = stats.max_drawdown.max(peak - stats.realized_pnl);
        }
        let decided = stats.wins + stats.losses;
        if decided > 0 {
            stats.win_rate = stats.wins as f64 / decided as f64;
        }
        stats
    }
}

/// Serializable listing entry for an open order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveOrderView {
    pub id: String,
    pub remote_id: Option<String>,
    pub instrument: String,
    pub symbol: String,
    pub mode: ExecutionMode,
    pub state: OrderState,
    pub quantity: u32,
    pub entry_price: Price,
    pub target_price: Price,
    pub stop_loss: Price,
    pub fill_price: Option<Price>,
    pub risk_score: f64,
    pub placed_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl From<&Order> for ActiveOrderView {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id.clone(),
            remote_id: order.remote_id.clone(),
            instrument: order.instrument().to_string(),
            symbol: order.symbol.clone(),
            mode: order.mode,
            state: order.state,
            quantity: order.quantity,
            entry_price: order.intent.entry_price,
            target_price: order.intent.target_price,
            stop_loss: order.intent.stop_loss,
            fill_price: order.fill_price,
            risk_score: order.risk_score,
            placed_at: order.placed_at,
            filled_at: order.filled_at,
        }
    }
}

impl OrderLifecycleManager {
    pub async fn daily_stats(&self) -> DailyStats {
        self.daily_stats_at(Utc::now()).await
    }

    /// Statistics over orders that exited on the local trading day of `now`
    pub async fn daily_stats_at(&self, now: DateTime<Utc>) -> DailyStats {
        let session = self.risk.read().await.session().clone();
        let today = session.local_date(now);

        let orders = self.orders.read().await;
        let open_orders = orders.values().filter(|order| order.is_open()).count();
        let exits = orders.values().filter(|order| {
            order
                .exit
                .as_ref()
                .map(|exit| session.local_date(exit.time) == today)
                .unwrap_or(false)
        });

        DailyStats::from_exits(exits, open_orders)
    }

    /// Open orders, oldest first
    pub async fn active_orders(&self) -> Vec<ActiveOrderView> {
        let orders = self.orders.read().await;
        let mut active: Vec<ActiveOrderView> = orders
            .values()
            .filter(|order| order.is_open())
            .map(ActiveOrderView::from)
            .collect();
        active.sort_by_key(|view| view.placed_at);
        active
    }
}
