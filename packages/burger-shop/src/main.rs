//! Burger shop
//!
//! Three buses share one in-memory broker:
//!
//! - `Front` takes orders and pings the kitchen
//! - `Cashier` runs the meal saga
//! - `Kitchen` preps food and cooks burgers
//!
//! Set `BURGER_SHOP_ORDERS` to change how many orders are placed.

mod cashier;
mod kitchen;
mod messages;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use servicebus::{Bus, BusConfig, CorrelationId, InMemoryBroker};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cashier::{Counter, Meal};
use crate::kitchen::{Grill, Intercom, PrepStation};
use crate::messages::{BurgerCooked, CookBurger, FoodPrepped, NewOrder, OrderReady, Ping, Pong, PrepFood, Size};

const MEALS: [&str; 3] = ["Big Mac", "Quarter Pounder", "McChicken"];

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,servicebus=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting burger shop");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Retry settings come from SERVICEBUS_*; queue names are fixed per role.
    let base = BusConfig::from_env()?;
    let orders: usize = env::var("BURGER_SHOP_ORDERS")
        .unwrap_or_else(|_| "3".to_string())
        .parse()
        .context("BURGER_SHOP_ORDERS must be a valid number")?;
    let config = |queue: &str| BusConfig {
        queue_name: queue.to_string(),
        ..base.clone()
    };

    // Nothing here inspects the broker's publish record.
    let broker = InMemoryBroker::with_publish_log_limit(0);
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<OrderReady>();

    let meal = Arc::new(Meal);
    let cashier = Bus::builder()
        .with_config(config("Cashier"))
        .with_transport(broker.clone())
        .with_process_manager_start::<NewOrder, _>(Arc::clone(&meal))
        .with_process_manager_handler::<FoodPrepped, _>(Arc::clone(&meal))
        .with_process_manager_handler::<BurgerCooked, _>(meal)
        .build()?;

    let kitchen = Bus::builder()
        .with_config(config("Kitchen"))
        .with_transport(broker.clone())
        .with_handler::<PrepFood, _>(Arc::new(PrepStation { max_millis: 200 }))
        .with_handler::<CookBurger, _>(Arc::new(Grill { max_millis: 200 }))
        .with_handler::<Ping, _>(Arc::new(Intercom))
        .build()?;

    let front = Bus::builder()
        .with_config(
            config("Front")
                .with_queue_mapping::<NewOrder>("Cashier")
                .with_queue_mapping::<Ping>("Kitchen"),
        )
        .with_transport(broker.clone())
        .with_handler::<OrderReady, _>(Arc::new(Counter::new(ready_tx)))
        .build()?;

    for bus in [&cashier, &kitchen, &front] {
        bus.start_consuming()
            .await
            .with_context(|| format!("Failed to start consuming on {}", bus.queue_name()))?;
    }

    let pong: Pong = front
        .send_request_timeout(
            &Ping {
                correlation_id: CorrelationId::new(),
                sent_by: front.queue_name().to_string(),
            },
            Duration::from_secs(5),
        )
        .await
        .context("Kitchen did not answer the ping")?;
    tracing::info!(answered_by = %pong.answered_by, "kitchen is up");

    for i in 0..orders {
        let order = NewOrder {
            correlation_id: CorrelationId::new(),
            meal: MEALS[i % MEALS.len()].to_string(),
            size: if i % 2 == 0 { Size::Large } else { Size::Regular },
        };
        tracing::info!(order_id = %order.correlation_id, meal = %order.meal, size = %order.size, "placing order");
        front.send(&order).await?;
    }

    let mut served = 0;
    while served < orders {
        match tokio::time::timeout(Duration::from_secs(10), ready_rx.recv()).await {
            Ok(Some(order)) => {
                served += 1;
                tracing::info!(
                    order_id = %order.correlation_id,
                    meal = %order.meal,
                    size = %order.size,
                    served,
                    "order served"
                );
            }
            Ok(None) => bail!("order counter closed"),
            Err(_) => bail!("timed out with {} of {} orders served", served, orders),
        }
    }

    for bus in [&front, &kitchen, &cashier] {
        bus.shutdown().await;
    }
    tracing::info!(served, "burger shop closed");
    Ok(())
}
