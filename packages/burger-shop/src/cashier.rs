//! The meal saga: one instance per order, finished once both the food and the
//! burger are done.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use servicebus::{
    async_trait, ConsumeContext, MessageHandler, ProcessManager, ProcessManagerHandler,
    ProcessState, StartProcessManager,
};
use tokio::sync::mpsc;
use tracing::info;

use crate::messages::{BurgerCooked, CookBurger, FoodPrepped, NewOrder, OrderReady, PrepFood, Size};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MealData {
    pub meal: String,
    pub size: Size,
    pub food_prepped: bool,
    pub burger_cooked: bool,
}

impl Default for MealData {
    fn default() -> Self {
        Self {
            meal: String::new(),
            size: Size::Regular,
            food_prepped: false,
            burger_cooked: false,
        }
    }
}

pub struct Meal;

impl Meal {
    async fn finish_if_ready(state: &mut ProcessState<MealData>, ctx: &ConsumeContext) -> Result<()> {
        if !(state.data.food_prepped && state.data.burger_cooked) {
            return Ok(());
        }

        ctx.bus()
            .publish(&OrderReady {
                correlation_id: state.correlation_id,
                meal: state.data.meal.clone(),
                size: state.data.size,
            })
            .await?;
        state.mark_complete();
        info!(order_id = %state.correlation_id, "order ready");
        Ok(())
    }
}

impl ProcessManager for Meal {
    type Data = MealData;

    fn name(&self) -> &'static str {
        "BurgerShop.Meal"
    }
}

#[async_trait]
impl StartProcessManager<NewOrder> for Meal {
    async fn handle_start(
        &self,
        order: NewOrder,
        state: &mut ProcessState<MealData>,
        ctx: &ConsumeContext,
    ) -> Result<()> {
        state.data.meal = order.meal;
        state.data.size = order.size;
        let order_id = state.correlation_id;
        info!(%order_id, meal = %state.data.meal, size = %order.size, "new order received");

        ctx.bus()
            .publish(&PrepFood {
                correlation_id: order_id,
                bun_size: order.size,
            })
            .await?;
        ctx.bus()
            .publish(&CookBurger {
                correlation_id: order_id,
                burger_size: order.size,
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessManagerHandler<FoodPrepped> for Meal {
    async fn handle(
        &self,
        message: FoodPrepped,
        state: &mut ProcessState<MealData>,
        ctx: &ConsumeContext,
    ) -> Result<()> {
        info!(order_id = %message.correlation_id, "food prepped");
        state.data.food_prepped = true;
        Meal::finish_if_ready(state, ctx).await
    }
}

#[async_trait]
impl ProcessManagerHandler<BurgerCooked> for Meal {
    async fn handle(
        &self,
        message: BurgerCooked,
        state: &mut ProcessState<MealData>,
        ctx: &ConsumeContext,
    ) -> Result<()> {
        info!(order_id = %message.correlation_id, "burger cooked");
        state.data.burger_cooked = true;
        Meal::finish_if_ready(state, ctx).await
    }
}

/// Hands finished orders to the front counter.
pub struct Counter {
    ready: mpsc::UnboundedSender<OrderReady>,
}

impl Counter {
    pub fn new(ready: mpsc::UnboundedSender<OrderReady>) -> Self {
        Self { ready }
    }
}

#[async_trait]
impl MessageHandler<OrderReady> for Counter {
    async fn handle(&self, order: OrderReady, _ctx: &ConsumeContext) -> Result<()> {
        // The receiver goes away once every expected order has been served.
        let _ = self.ready.send(order);
        Ok(())
    }
}
