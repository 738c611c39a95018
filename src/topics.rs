//! Routing keys and exchanges shared by the services.

/// Default exchange for cross-service notifications.
pub const NOTIFICATIONS_EXCHANGE: &str = "notifications";

// product-customer service
pub const CUSTOMER_BROADCAST: &str = "customer.*";
pub const CREATE_CUSTOMER: &str = "customer.create_customer";

pub const PRODUCT_BROADCAST: &str = "product.*";
pub const CREATE_PRODUCT: &str = "product.create_product";

// order service
pub const CREATE_ORDER: &str = "order.create_order";

// notification service
pub const CREATE_NOTIFICATION: &str = "notification.create";
