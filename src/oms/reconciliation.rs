use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::oms::costs::slippage_between;
use crate::oms::events::OrderEvent;
use crate::oms::manager::{
    OrderLifecycleManager, FILL_LEDGER_CLASS, ORDER_CANCEL_CLASS, ORDER_LEDGER_CLASS,
    ORDER_PLACEMENT_CLASS, QUOTE_CLASS,
};
use crate::oms::order::{ExitReason, ExitRecord, Order, OrderState};
use crate::risk::TradeEvent;
use crate::traits::{FillLedgerEntry, LedgerStatus, OrderLedgerEntry, OrderRequest, OrderSide};
use crate::types::{ExecutionMode, Price};

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    /// Pass skipped entirely while backing off from a rate limit
    pub backed_off: bool,
    pub filled: usize,
    pub exited: usize,
    pub cancelled: usize,
    pub rejected: usize,
    /// Orders skipped for implausible or missing prices
    pub skipped: usize,
    /// Real-order ledgers could not be fetched this pass
    pub ledger_unavailable: bool,
}

/// Classify an observed exit price as target or stop-loss.
///
/// Heuristic: whichever level is numerically closer to the exit price wins,
/// ties go to target. Levels close together can be misclassified.
pub fn classify_exit(exit_price: Price, target: Price, stop_loss: Price) -> ExitReason {
    let to_target = (exit_price.value() - target.value()).abs();
    let to_stop = (exit_price.value() - stop_loss.value()).abs();
    if to_target <= to_stop {
        ExitReason::Target
    } else {
        ExitReason::StopLoss
    }
}

/// Earliest closing fill for an order, strictly after its entry
pub fn find_closing_fill<'a>(order: &Order, fills: &'a [FillLedgerEntry]) -> Option<&'a FillLedgerEntry> {
    let filled_at = order.filled_at?;
    fills
        .iter()
        .filter(|fill| {
            fill.side == OrderSide::Sell
                && fill.symbol == order.symbol
                && fill.timestamp > filled_at
                && order.remote_id.as_deref() != Some(fill.remote_order_id.as_str())
        })
        .min_by_key(|fill| fill.timestamp)
}

impl OrderLifecycleManager {
    /// One reconciliation pass over all open orders.
    ///
    /// Safe to repeat: orders whose exit is already recorded are left alone.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        if self.skip_next_pass.swap(false, Ordering::SeqCst) {
            debug!("Reconciliation backing off after rate limit");
            report.backed_off = true;
            return Ok(report);
        }

        let open: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|order| order.is_open())
            .cloned()
            .collect();
        if open.is_empty() {
            return Ok(report);
        }

        let (real, paper): (Vec<Order>, Vec<Order>) = open
            .into_iter()
            .partition(|order| order.mode == ExecutionMode::Real);

        if !real.is_empty() {
            self.reconcile_real(&real, now, &mut report).await;
        }
        for order in &paper {
            self.reconcile_paper(order, now, &mut report).await;
        }

        self.apply_forced_exits(now, &mut report).await;
        Ok(report)
    }

    async fn fetch_ledgers(&self) -> Result<(Vec<OrderLedgerEntry>, Vec<FillLedgerEntry>)> {
        let order_ledger = self
            .supervisor
            .execute_yielding_rate_limits(ORDER_LEDGER_CLASS, || self.brokerage.order_ledger());
        let fill_ledger = self
            .supervisor
            .execute_yielding_rate_limits(FILL_LEDGER_CLASS, || self.brokerage.fill_ledger());

        let (orders, fills) = tokio::join!(order_ledger, fill_ledger);
        Ok((orders?, fills?))
    }

    async fn reconcile_real(&self, orders: &[Order], now: DateTime<Utc>, report: &mut ReconcileReport) {
        let (ledger, fills) = match self.fetch_ledgers().await {
            Ok(ledgers) => ledgers,
            Err(e) if e.is_rate_limited() => {
                // The loop sleeps one interval per pass; skipping the next
                // pass leaves a full interval with no ledger calls
                self.skip_next_pass.store(true, Ordering::SeqCst);
                if self.throttle.should_log("reconcile-rate-limited") {
                    warn!("Ledger fetch rate limited, skipping one reconciliation interval");
                }
                report.ledger_unavailable = true;
                return;
            }
            Err(e) => {
                if self.throttle.should_log("reconcile-ledger-error") {
                    warn!("Ledger fetch failed, real orders not reconciled this pass: {}", e);
                }
                report.ledger_unavailable = true;
                return;
            }
        };

        for order in orders {
            let mut order = order.clone();

            if order.state == OrderState::Placed {
                let entry = order
                    .remote_id
                    .as_deref()
                    .and_then(|remote_id| ledger.iter().find(|e| e.remote_id == remote_id));
                let entry = match entry {
                    Some(entry) => entry,
                    None => continue,
                };

                match entry.status {
                    LedgerStatus::Open => continue,
                    LedgerStatus::Complete => match self.apply_remote_fill(&order, entry).await {
                        Some(filled) => {
                            report.filled += 1;
                            order = filled;
                        }
                        None => continue,
                    },
                    LedgerStatus::Cancelled | LedgerStatus::Rejected => {
                        if self.apply_remote_termination(&order, entry, now).await {
                            if entry.status == LedgerStatus::Cancelled {
                                report.cancelled += 1;
                            } else {
                                report.rejected += 1;
                            }
                        }
                        continue;
                    }
                }
            }

            if order.state != OrderState::Filled || order.has_exited() {
                continue;
            }

            if let Some(fill) = find_closing_fill(&order, &fills) {
                let reason = classify_exit(fill.price, order.intent.target_price, order.intent.stop_loss);
                let cost = self.costs.leg_cost(OrderSide::Sell, fill.price, order.quantity);
                if self
                    .finalize_exit(&order.id, fill.price, fill.timestamp, reason, cost)
                    .await
                    .is_some()
                {
                    report.exited += 1;
                }
            }
        }
    }

    async fn apply_remote_fill(&self, order: &Order, entry: &OrderLedgerEntry) -> Option<Order> {
        let filled = {
            let mut orders = self.orders.write().await;
            let current = orders.get_mut(&order.id)?;
            if current.state != OrderState::Placed {
                return None;
            }

            let price = if entry.average_price.is_positive() {
                entry.average_price
            } else {
                current.intent.entry_price
            };
            let cost = self.costs.leg_cost(OrderSide::Buy, price, current.quantity);
            if let Err(e) = current.mark_filled(price, entry.updated_at, cost) {
                error!("{}", e);
                return None;
            }
            current.clone()
        };

        let price = filled.fill_price.unwrap_or(filled.intent.entry_price);
        info!(
            "Order {} filled at {} (slippage {:.4})",
            filled.id,
            price,
            slippage_between(filled.intent.entry_price, price)
        );
        self.events.publish(OrderEvent::Filled {
            message: format!("BUY {} x{} filled at {}", filled.symbol, filled.quantity, price),
            order: filled.clone(),
        });
        Some(filled)
    }

    async fn apply_remote_termination(
        &self,
        order: &Order,
        entry: &OrderLedgerEntry,
        now: DateTime<Utc>,
    ) -> bool {
        let message = entry
            .status_message
            .clone()
            .unwrap_or_else(|| format!("{:?} by brokerage", entry.status));

        let terminated = {
            let mut orders = self.orders.write().await;
            let current = match orders.get_mut(&order.id) {
                Some(current) if current.state == OrderState::Placed => current,
                _ => return false,
            };
            let result = match entry.status {
                LedgerStatus::Cancelled => current.mark_cancelled(message.clone()),
                _ => current.mark_rejected(message.clone()),
            };
            if let Err(e) = result {
                error!("{}", e);
                return false;
            }
            current.clone()
        };

        self.risk
            .write()
            .await
            .record_trade_at(TradeEvent::Released, &terminated.intent, now);

        warn!("Order {} {}: {}", terminated.id, terminated.state, message);
        match terminated.state {
            OrderState::Cancelled => self.events.publish(OrderEvent::Cancelled {
                order: terminated,
                message,
            }),
            _ => self.events.publish(OrderEvent::Rejected {
                intent: terminated.intent,
                reason: message,
            }),
        }
        true
    }

    async fn reconcile_paper(&self, order: &Order, now: DateTime<Utc>, report: &mut ReconcileReport) {
        if order.state != OrderState::Filled || order.has_exited() {
            return;
        }
        let fill_price = match order.fill_price {
            Some(price) => price,
            None => return,
        };

        let feed = match &self.feed {
            Some(feed) => feed,
            None => return,
        };
        let price = feed.get_current_price(&order.symbol);
        if price.is_zero() {
            if self.throttle.should_log(&format!("no-price:{}", order.symbol)) {
                debug!("No live price for {}, skipping", order.symbol);
            }
            report.skipped += 1;
            return;
        }

        let ratio = price / fill_price;
        if ratio < self.config.min_price_ratio || ratio > self.config.max_price_ratio {
            if self.throttle.should_log(&format!("price-ratio:{}", order.symbol)) {
                warn!(
                    "Implausible price {} for {} (filled at {}), skipping this pass",
                    price, order.symbol, fill_price
                );
            }
            report.skipped += 1;
            return;
        }

        let reason = if price >= order.intent.target_price {
            ExitReason::Target
        } else if price <= order.intent.stop_loss {
            ExitReason::StopLoss
        } else {
            return;
        };

        let in_session = self.risk.read().await.session().is_open(now);
        let exit_price =
            self.slippage
                .apply_to_exit(reason, price, feed.volatility(&order.symbol), in_session);
        let cost = self.costs.leg_cost(OrderSide::Sell, exit_price, order.quantity);

        if self
            .finalize_exit(&order.id, exit_price, now, reason, cost)
            .await
            .is_some()
        {
            report.exited += 1;
        }
    }

    async fn apply_forced_exits(&self, now: DateTime<Utc>, report: &mut ReconcileReport) {
        let risk_exit = self.risk.read().await.should_force_risk_exit(now);
        let max_holding = chrono::Duration::from_std(self.config.max_holding)
            .unwrap_or_else(|_| chrono::Duration::hours(4));

        let candidates: Vec<(Order, ExitReason)> = self
            .orders
            .read()
            .await
            .values()
            .filter(|order| order.state == OrderState::Filled && !order.has_exited())
            .filter_map(|order| {
                let held_too_long = order
                    .filled_at
                    .map(|filled_at| now - filled_at >= max_holding)
                    .unwrap_or(false);
                if held_too_long {
                    Some((order.clone(), ExitReason::Timeout))
                } else if risk_exit {
                    Some((order.clone(), ExitReason::RiskManagement))
                } else {
                    None
                }
            })
            .collect();

        if risk_exit && !candidates.is_empty() {
            warn!("Intraday loss limit crossed, forcing {} positions out", candidates.len());
        }

        for (order, reason) in candidates {
            if self.force_exit(&order, reason, now).await.is_some() {
                report.exited += 1;
            }
        }
    }

    /// Close a filled order regardless of price.
    ///
    /// Real orders place a closing sell first; if that fails the order stays
    /// open for the next pass.
    pub(super) async fn force_exit(
        &self,
        order: &Order,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Option<ExitRecord> {
        let exit_price = match order.mode {
            ExecutionMode::Paper => self.live_or_fill_price(order),
            ExecutionMode::Real => {
                let request = OrderRequest::market(order.symbol.clone(), OrderSide::Sell, order.quantity)
                    .with_tag(format!("exit-{}", order.id.chars().take(8).collect::<String>()));
                let placed = self
                    .supervisor
                    .execute_with_recovery(ORDER_PLACEMENT_CLASS, || {
                        self.brokerage.place_order(&request)
                    })
                    .await;
                if let Err(e) = placed {
                    error!("Closing order for {} failed, retrying next pass: {}", order.id, e);
                    return None;
                }

                let quote = self
                    .supervisor
                    .execute_with_recovery(QUOTE_CLASS, || self.brokerage.quote(&order.symbol))
                    .await;
                match quote {
                    Ok(quote) if quote.last_price.is_positive() => quote.last_price,
                    _ => self.live_or_fill_price(order),
                }
            }
        };

        let cost = self.costs.leg_cost(OrderSide::Sell, exit_price, order.quantity);
        self.finalize_exit(&order.id, exit_price, now, reason, cost).await
    }

    fn live_or_fill_price(&self, order: &Order) -> Price {
        let live = self
            .feed
            .as_ref()
            .map(|feed| feed.get_current_price(&order.symbol))
            .unwrap_or_else(Price::zero);
        if live.is_positive() {
            live
        } else {
            order.fill_price.unwrap_or(order.intent.entry_price)
        }
    }

    /// Write exit fields, update the ledger and publish `order-exited`.
    ///
    /// Returns `None` when the order already exited.
    pub(super) async fn finalize_exit(
        &self,
        order_id: &str,
        price: Price,
        time: DateTime<Utc>,
        reason: ExitReason,
        exit_cost: Decimal,
    ) -> Option<ExitRecord> {
        let (order, record) = {
            let mut orders = self.orders.write().await;
            let order = orders.get_mut(order_id)?;
            if order.has_exited() {
                debug!("Order {} already exited, skipping", order_id);
                return None;
            }
            let record = match order.record_exit(price, time, reason, exit_cost) {
                Ok(record) => record.clone(),
                Err(e) => {
                    error!("Exit of order {} refused: {}", order_id, e);
                    return None;
                }
            };
            (order.clone(), record)
        };

        self.risk
            .write()
            .await
            .record_trade_at(TradeEvent::Closed { pnl: record.pnl }, &order.intent, time);

        info!(
            "Order {} exited ({}) at {}, P&L {}",
            order.id, reason, price, record.pnl
        );
        self.events.publish(OrderEvent::Exited {
            message: format!(
                "SELL {} x{} at {} ({}), P&L {}",
                order.symbol, order.quantity, price, reason, record.pnl
            ),
            exit_price: price,
            pnl: record.pnl,
            order,
        });
        Some(record)
    }

    /// Force-terminate orders stuck past the safety age.
    ///
    /// Placed orders are cancelled, filled orders held past max holding plus
    /// the safety age are closed. Both publish `order-exited` so holders of
    /// per-instrument locks release them.
    pub async fn cleanup_stale_orders_at(&self, now: DateTime<Utc>) -> usize {
        let stale_age = chrono::Duration::from_std(self.config.stale_order_age)
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        let filled_limit = stale_age
            + chrono::Duration::from_std(self.config.max_holding)
                .unwrap_or_else(|_| chrono::Duration::hours(4));

        let stale: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|order| match order.state {
                OrderState::Placed => now - order.placed_at >= stale_age,
                OrderState::Filled => order
                    .filled_at
                    .map(|filled_at| now - filled_at >= filled_limit)
                    .unwrap_or(false),
                _ => false,
            })
            .cloned()
            .collect();

        let mut cleaned = 0;
        for order in stale {
            let done = match order.state {
                OrderState::Placed => self.cancel_stale(&order, now).await,
                _ => {
                    let price = self.live_or_fill_price(&order);
                    let cost = self.costs.leg_cost(OrderSide::Sell, price, order.quantity);
                    self.finalize_exit(&order.id, price, now, ExitReason::StaleCleanup, cost)
                        .await
                        .is_some()
                }
            };
            if done {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            warn!("Stale-order cleanup terminated {} orders", cleaned);
        }
        cleaned
    }

    async fn cancel_stale(&self, order: &Order, now: DateTime<Utc>) -> bool {
        if order.mode == ExecutionMode::Real {
            if let Some(remote_id) = &order.remote_id {
                // Best effort; the local order is terminated either way
                let cancelled = self
                    .supervisor
                    .execute_with_recovery(ORDER_CANCEL_CLASS, || {
                        self.brokerage.cancel_order(remote_id)
                    })
                    .await;
                if let Err(e) = cancelled {
                    warn!("Remote cancel of stale order {} failed: {}", order.id, e);
                }
            }
        }

        let cancelled = {
            let mut orders = self.orders.write().await;
            let current = match orders.get_mut(&order.id) {
                Some(current) if current.state == OrderState::Placed => current,
                _ => return false,
            };
            if let Err(e) = current.mark_cancelled("stale order cleanup") {
                error!("{}", e);
                return false;
            }
            current.clone()
        };

        self.risk
            .write()
            .await
            .record_trade_at(TradeEvent::Released, &cancelled.intent, now);

        let entry = cancelled.intent.entry_price;
        self.events.publish(OrderEvent::Exited {
            message: format!(
                "Stale order for {} cancelled after {} minutes unfilled",
                cancelled.symbol,
                (now - cancelled.placed_at).num_minutes()
            ),
            exit_price: entry,
            pnl: Decimal::ZERO,
            order: cancelled,
        });
        true
    }
}
