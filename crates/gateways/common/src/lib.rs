pub mod simulated;

pub use simulated::{SimulatedGateway, SimulatedGatewayConfig};
