//! Order saga: CRUD persistence, routed by the order ID in every message.

use ironsaga::{HasInstanceId, InstanceId, Message, MessageTypes, Reaction, Result, Saga};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    AwaitingPayment,
    Paid,
    Shipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub status: OrderStatus,
    pub amount_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, HasInstanceId)]
#[serde(tag = "type")]
#[instance_id(order_id)]
pub enum OrderMessage {
    OrderPlaced { order_id: String, amount_cents: u64 },
    PaymentReceived { order_id: String },
    OrderShipped { order_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrderCommand {
    ChargeCard { order_id: String, amount_cents: u64 },
    ShipOrder { order_id: String },
}

pub struct OrderSaga;

impl Saga for OrderSaga {
    type Data = Order;
    type Message = OrderMessage;

    const PERSISTENCE_KEY: &'static str = "orders";

    fn message_types() -> MessageTypes {
        MessageTypes::new(["OrderPlaced"], ["PaymentReceived", "OrderShipped"])
    }

    fn new_data(_: &InstanceId) -> Order {
        Order {
            status: OrderStatus::New,
            amount_cents: 0,
        }
    }

    fn handle_message(data: &Order, message: OrderMessage) -> Result<Reaction<Order>> {
        match message {
            // A repeated placement leaves the order alone.
            OrderMessage::OrderPlaced { .. } if data.status != OrderStatus::New => {
                Ok(Reaction::none())
            }
            OrderMessage::OrderPlaced {
                order_id,
                amount_cents,
            } => Ok(Reaction::update(Order {
                status: OrderStatus::AwaitingPayment,
                amount_cents,
            })
            .send(Message::command(&OrderCommand::ChargeCard {
                order_id,
                amount_cents,
            })?)),
            OrderMessage::PaymentReceived { order_id } => Ok(Reaction::update(Order {
                status: OrderStatus::Paid,
                ..data.clone()
            })
            .send(Message::command(&OrderCommand::ShipOrder { order_id })?)),
            OrderMessage::OrderShipped { .. } => Ok(Reaction::update(Order {
                status: OrderStatus::Shipped,
                ..data.clone()
            })),
        }
    }

    fn is_instance_complete(data: &Order) -> bool {
        data.status == OrderStatus::Shipped
    }
}

pub fn placed(order_id: &str, amount_cents: u64) -> OrderMessage {
    OrderMessage::OrderPlaced {
        order_id: order_id.into(),
        amount_cents,
    }
}

pub fn paid(order_id: &str) -> OrderMessage {
    OrderMessage::PaymentReceived {
        order_id: order_id.into(),
    }
}

pub fn shipped(order_id: &str) -> OrderMessage {
    OrderMessage::OrderShipped {
        order_id: order_id.into(),
    }
}
