use log::{info, warn};
use options_oms::{
    connectors::{SimulatedBrokerage, SimulatedFeed},
    init_logging,
    oms::OrderEvent,
    Direction, EngineConfig, ErrorRecoverySupervisor, ExecutionMode, HealthChecker,
    MarketDataFeedManager, OptionType, OrderLifecycleManager, Price, PushTransport, RiskEngine,
    SnapshotSource, TradeIntent,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::time::Duration;

const SESSION_LENGTH: Duration = Duration::from_secs(20);

fn print_event(event: &OrderEvent) {
    match event {
        OrderEvent::Filled { message, .. } => println!("[FILLED]    {}", message),
        OrderEvent::Exited { message, .. } => println!("[EXITED]    {}", message),
        OrderEvent::Cancelled { message, .. } => println!("[CANCELLED] {}", message),
        OrderEvent::Rejected { intent, reason } => {
            println!("[REJECTED]  {} {}: {}", intent.instrument, intent.option_type, reason)
        }
        OrderEvent::Blocked { intent, assessment } => println!(
            "[BLOCKED]   {} score {:.1}: {}",
            intent.instrument,
            assessment.score,
            assessment.reasons.join(", ")
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    // This binary only ever simulates
    config.mode = ExecutionMode::Paper;
    config.orders.mode = ExecutionMode::Paper;
    config.orders.reconcile_interval = Duration::from_millis(500);
    config.orders.paper_fill_delay = Duration::from_millis(300);
    config.feed.grace_period = Duration::from_secs(2);

    init_logging(&config.log_level, config.log_file.as_deref())?;
    info!("Starting paper session for {:?}", config.instruments);

    let brokerage = Arc::new(SimulatedBrokerage::new(dec!(100000)));
    for symbol in &config.instruments {
        brokerage.set_price(symbol, Price::new(dec!(50))).await;
    }
    let feed_transport = Arc::new(SimulatedFeed::new());

    let supervisor = Arc::new(
        ErrorRecoverySupervisor::new(config.supervisor.clone()).with_reauthenticator(brokerage.clone()),
    );
    let feed = MarketDataFeedManager::new(
        config.feed.clone(),
        config.instruments.clone(),
        Some(feed_transport.clone() as Arc<dyn PushTransport>),
        Some(brokerage.clone() as Arc<dyn SnapshotSource>),
        supervisor.clone(),
    );

    // Premium drifts up from 50 until it clears the target
    let ticker = {
        let feed_transport = feed_transport.clone();
        let brokerage = brokerage.clone();
        let symbols = config.instruments.clone();
        tokio::spawn(async move {
            let mut price = dec!(50);
            loop {
                for symbol in &symbols {
                    feed_transport.push_tick(symbol, Price::new(price));
                    brokerage.set_price(symbol, Price::new(price)).await;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
                if price < dec!(60) {
                    price += dec!(0.25);
                }
            }
        })
    };

    feed.initialize().await?;

    let risk = RiskEngine::new(config.risk.clone(), dec!(100000));
    let manager = OrderLifecycleManager::new(
        config.orders.clone(),
        risk,
        brokerage.clone(),
        supervisor.clone(),
        Some(feed.clone()),
    );

    let mut events = manager.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    manager.start().await;

    let intent = TradeIntent::new(
        "NIFTY",
        Direction::Bullish,
        OptionType::Call,
        Price::new(dec!(50)),
        Price::new(dec!(57.5)),
        Price::new(dec!(42.5)),
        85.0,
    );
    let outcome = manager.handle_intent(intent.clone()).await;
    info!("Intent outcome: {:?}", outcome);

    // A second intent for the same instrument is rejected while the first is open
    manager.handle_intent(intent).await;

    let deadline = tokio::time::Instant::now() + SESSION_LENGTH;
    while tokio::time::Instant::now() < deadline {
        if manager.active_orders().await.is_empty() && manager.daily_stats().await.trades > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let health = HealthChecker::new();
    health.observe(Some(feed.as_ref()), &supervisor).await;
    let report = health.check().await;
    let stats = manager.daily_stats().await;

    println!("\nDaily stats: {}", serde_json::to_string_pretty(&stats)?);
    println!("Health: {:?} ({})", report.status, report.message);
    if !manager.active_orders().await.is_empty() {
        warn!("Session ended with open orders");
    }

    manager.stop().await;
    feed.disconnect().await;
    ticker.abort();
    printer.abort();
    Ok(())
}
