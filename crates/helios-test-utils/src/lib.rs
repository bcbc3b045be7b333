//! Test utilities: a typed WebSocket client for driving a helios server
//! from integration tests.

pub mod mock_ws_client;

pub use mock_ws_client::MockWsClient;
