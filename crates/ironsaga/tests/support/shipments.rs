//! Shipment saga: event-sourced, routed through key sets.
//!
//! A shipment is first known by its shipment ID and later also by the
//! tracking number printed on its label.

use std::collections::BTreeSet;

use ironsaga::{
    Envelope, EventSourcedSaga, InstanceId, KeySetSaga, Message, MessageTypes, Reaction, Result,
    Saga,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub shipment_id: Option<String>,
    pub tracking: Option<String>,
    pub scans: u32,
    pub delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ShipmentMessage {
    ShipmentRequested { shipment_id: String },
    LabelPrinted { shipment_id: String, tracking: String },
    ParcelScanned { tracking: String },
    ParcelDelivered { tracking: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ShipmentEvent {
    ShipmentOpened { shipment_id: String },
    TrackingAssigned { tracking: String },
    ParcelMoved,
    ShipmentDelivered,
}

pub struct ShipmentSaga;

impl Saga for ShipmentSaga {
    type Data = Shipment;
    type Message = ShipmentMessage;

    const PERSISTENCE_KEY: &'static str = "shipments";

    fn message_types() -> MessageTypes {
        MessageTypes::new(
            ["ShipmentRequested"],
            ["LabelPrinted", "ParcelScanned", "ParcelDelivered"],
        )
    }

    fn new_data(_: &InstanceId) -> Shipment {
        Shipment::default()
    }

    fn handle_message(data: &Shipment, message: ShipmentMessage) -> Result<Reaction<Shipment>> {
        let event = match message {
            ShipmentMessage::ShipmentRequested { .. } if data.shipment_id.is_some() => {
                return Ok(Reaction::none());
            }
            ShipmentMessage::ShipmentRequested { shipment_id } => {
                ShipmentEvent::ShipmentOpened { shipment_id }
            }
            ShipmentMessage::LabelPrinted { tracking, .. } => {
                ShipmentEvent::TrackingAssigned { tracking }
            }
            ShipmentMessage::ParcelScanned { .. } => ShipmentEvent::ParcelMoved,
            ShipmentMessage::ParcelDelivered { .. } => ShipmentEvent::ShipmentDelivered,
        };
        Ok(Reaction::none().send(Message::event(&event)?))
    }

    fn is_instance_complete(data: &Shipment) -> bool {
        data.delivered
    }
}

impl EventSourcedSaga for ShipmentSaga {
    type Event = ShipmentEvent;

    fn apply_event(data: &mut Shipment, event: ShipmentEvent) {
        match event {
            ShipmentEvent::ShipmentOpened { shipment_id } => data.shipment_id = Some(shipment_id),
            ShipmentEvent::TrackingAssigned { tracking } => data.tracking = Some(tracking),
            ShipmentEvent::ParcelMoved => data.scans += 1,
            ShipmentEvent::ShipmentDelivered => data.delivered = true,
        }
    }
}

impl KeySetSaga for ShipmentSaga {
    fn mapping_key(message: &ShipmentMessage) -> Option<String> {
        match message {
            ShipmentMessage::ShipmentRequested { shipment_id }
            | ShipmentMessage::LabelPrinted { shipment_id, .. } => Some(shipment_key(shipment_id)),
            ShipmentMessage::ParcelScanned { tracking }
            | ShipmentMessage::ParcelDelivered { tracking } => Some(tracking_key(tracking)),
        }
    }

    fn instance_keys(data: &Shipment) -> BTreeSet<String> {
        let shipment = data.shipment_id.as_deref().map(shipment_key);
        let tracking = data.tracking.as_deref().map(tracking_key);
        shipment.into_iter().chain(tracking).collect()
    }

    fn generate_instance_id(_: &Envelope, message: &ShipmentMessage) -> InstanceId {
        match message {
            ShipmentMessage::ShipmentRequested { shipment_id } => {
                InstanceId::new(format!("shp-{shipment_id}"))
            }
            _ => InstanceId::generate(),
        }
    }
}

pub fn shipment_key(shipment_id: &str) -> String {
    format!("shipment:{shipment_id}")
}

pub fn tracking_key(tracking: &str) -> String {
    format!("tracking:{tracking}")
}

pub fn requested(shipment_id: &str) -> ShipmentMessage {
    ShipmentMessage::ShipmentRequested {
        shipment_id: shipment_id.into(),
    }
}

pub fn label_printed(shipment_id: &str, tracking: &str) -> ShipmentMessage {
    ShipmentMessage::LabelPrinted {
        shipment_id: shipment_id.into(),
        tracking: tracking.into(),
    }
}

pub fn scanned(tracking: &str) -> ShipmentMessage {
    ShipmentMessage::ParcelScanned {
        tracking: tracking.into(),
    }
}

pub fn delivered(tracking: &str) -> ShipmentMessage {
    ShipmentMessage::ParcelDelivered {
        tracking: tracking.into(),
    }
}
