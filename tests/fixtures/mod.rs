//! Test fixtures

mod two_gateway;

pub use two_gateway::{TwoGatewayFixture, Tunnel, wait_until};
