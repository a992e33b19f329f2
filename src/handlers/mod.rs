//! Built-in command handlers

pub mod mqtt_publish;
pub mod system;

pub use mqtt_publish::{MqttPublishHandler, PublishRequest};
pub use system::SystemCommandHandler;
