use crate::config::TransportConfig;
use reqwest::Client;

/// One client per uploader; callers own it and hand clones to each component.
/// Per-call deadlines are applied by the transport governor, not here.
pub fn build_client(config: &TransportConfig) -> Client {
    Client::builder()
        .connect_timeout(config.connect_timeout())
        .user_agent(concat!("hermes-media/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}
