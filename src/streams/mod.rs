//! Venue stream tasks: forced-order intake, mark prices, user data.

pub mod backoff;
pub mod liquidation;
pub mod mark_price;
pub mod user_data;
