//! Message types shared by the integration tests.

use serde::{Deserialize, Serialize};
use servicebus::{CorrelationId, Message};

macro_rules! message {
    ($name:ident, $wire:literal { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            pub correlation_id: CorrelationId,
            $(pub $field: $ty,)*
        }

        impl Message for $name {
            fn correlation_id(&self) -> CorrelationId {
                self.correlation_id
            }

            fn message_type() -> &'static str {
                $wire
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Size {
    Regular,
    Large,
}

message!(NewOrder, "BurgerShop.NewOrder" { size: Size, customer: String });
message!(PrepFood, "BurgerShop.PrepFood" { size: Size });
message!(CookBurger, "BurgerShop.CookBurger" { size: Size });
message!(FoodPrepped, "BurgerShop.FoodPrepped" {});
message!(BurgerCooked, "BurgerShop.BurgerCooked" {});
message!(OrderReady, "BurgerShop.OrderReady" { customer: String });

message!(Ping, "Tests.Ping" { sequence: u32 });
message!(Pong, "Tests.Pong" { sequence: u32 });

message!(Tick, "Tests.Tick" { step: u32 });

// Carries correlation ids below the top level.
message!(Envelope, "Tests.Envelope" {
    label: String,
    parent: Option<CorrelationId>,
    children: Vec<Child>,
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Child {
    pub correlation_id: CorrelationId,
    pub note: String,
}

pub fn ping(sequence: u32) -> Ping {
    Ping {
        correlation_id: CorrelationId::new(),
        sequence,
    }
}
