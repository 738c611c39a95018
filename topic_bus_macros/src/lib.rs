mod bus_event;

use proc_macro::TokenStream;

// ============================================================================
// #[derive(BusEvent)]
// ============================================================================

/// Derive macro implementing `topic_bus::BusEvent`.
///
/// # Usage
///
/// ```ignore
/// #[derive(Serialize, Deserialize, BusEvent)]
/// #[bus_event(topic = "product.create_product")]
/// struct ProductCreated {
///     product_id: String,
/// }
/// ```
///
/// Attributes:
/// - `topic = "..."` (required): routing key the event is published under.
///   Must be dot-separated, non-empty segments and contain no `*`.
/// - `name = "..."`: logical type name for the envelope's `payload_type`
///   metadata. Defaults to the type's identifier.
#[proc_macro_derive(BusEvent, attributes(bus_event))]
pub fn derive_bus_event(input: TokenStream) -> TokenStream {
    bus_event::derive_bus_event(input)
}
