use std::time::Duration;

use anyhow::Result;
use servicebus::{async_trait, ConsumeContext, MessageHandler};
use tracing::{debug, info};

use crate::messages::{BurgerCooked, CookBurger, FoodPrepped, Ping, Pong, PrepFood};

/// Work takes a random while so replies reach the cashier in either order.
async fn busy(max_millis: u64) {
    tokio::time::sleep(Duration::from_millis(fastrand::u64(0..=max_millis))).await;
}

pub struct PrepStation {
    pub max_millis: u64,
}

#[async_trait]
impl MessageHandler<PrepFood> for PrepStation {
    async fn handle(&self, message: PrepFood, ctx: &ConsumeContext) -> Result<()> {
        debug!(order_id = %message.correlation_id, bun_size = %message.bun_size, "prepping food");
        busy(self.max_millis).await;
        ctx.bus()
            .publish(&FoodPrepped {
                correlation_id: message.correlation_id,
            })
            .await?;
        Ok(())
    }
}

pub struct Grill {
    pub max_millis: u64,
}

#[async_trait]
impl MessageHandler<CookBurger> for Grill {
    async fn handle(&self, message: CookBurger, ctx: &ConsumeContext) -> Result<()> {
        debug!(order_id = %message.correlation_id, burger_size = %message.burger_size, "flipping burger");
        busy(self.max_millis).await;
        ctx.bus()
            .publish(&BurgerCooked {
                correlation_id: message.correlation_id,
            })
            .await?;
        Ok(())
    }
}

/// Answers pings sent as requests.
pub struct Intercom;

#[async_trait]
impl MessageHandler<Ping> for Intercom {
    async fn handle(&self, ping: Ping, ctx: &ConsumeContext) -> Result<()> {
        info!(from = %ping.sent_by, request = ctx.is_request(), "ping");
        ctx.reply(&Pong {
            correlation_id: ping.correlation_id,
            answered_by: ctx.bus().queue_name().to_string(),
        })
        .await?;
        Ok(())
    }
}
