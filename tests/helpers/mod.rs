pub mod mock_proxy;
pub mod mock_server;
pub mod tls;
