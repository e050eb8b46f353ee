//! Messages exchanged between the front counter, the cashier and the kitchen.

use serde::{Deserialize, Serialize};
use servicebus::{CorrelationId, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Size {
    Regular,
    Large,
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Size::Regular => write!(f, "regular"),
            Size::Large => write!(f, "large"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub correlation_id: CorrelationId,
    pub meal: String,
    pub size: Size,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepFood {
    pub correlation_id: CorrelationId,
    pub bun_size: Size,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookBurger {
    pub correlation_id: CorrelationId,
    pub burger_size: Size,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoodPrepped {
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurgerCooked {
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReady {
    pub correlation_id: CorrelationId,
    pub meal: String,
    pub size: Size,
}

/// Health check sent by the front counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub correlation_id: CorrelationId,
    pub sent_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub correlation_id: CorrelationId,
    pub answered_by: String,
}

macro_rules! impl_message {
    ($($ty:ident => $name:literal),* $(,)?) => {
        $(
            impl Message for $ty {
                fn correlation_id(&self) -> CorrelationId {
                    self.correlation_id
                }

                fn message_type() -> &'static str {
                    $name
                }
            }
        )*
    };
}

impl_message! {
    NewOrder => "BurgerShop.NewOrder",
    PrepFood => "BurgerShop.PrepFood",
    CookBurger => "BurgerShop.CookBurger",
    FoodPrepped => "BurgerShop.FoodPrepped",
    BurgerCooked => "BurgerShop.BurgerCooked",
    OrderReady => "BurgerShop.OrderReady",
    Ping => "BurgerShop.Ping",
    Pong => "BurgerShop.Pong",
}
