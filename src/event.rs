//! Domain events that know their own routing key.

use serde::Serialize;

/// A domain event published on the bus.
///
/// Usually derived:
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use topic_bus::BusEvent;
///
/// #[derive(Serialize, Deserialize, BusEvent)]
/// #[bus_event(topic = "product.create_product")]
/// struct ProductCreated {
///     product_id: String,
/// }
///
/// assert_eq!(ProductCreated::TOPIC, "product.create_product");
/// assert_eq!(ProductCreated::NAME, "ProductCreated");
/// ```
pub trait BusEvent: Serialize {
    /// Routing key the event is published under.
    const TOPIC: &'static str;

    /// Logical type name, recorded in the envelope's `payload_type` metadata.
    const NAME: &'static str;
}
