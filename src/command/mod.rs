//! Command model, routing and source adapters

pub mod adapters;
pub mod model;
pub mod router;

pub use adapters::{BrokerAdapter, EndpointAdapter, StructuredCallAdapter};
pub use model::{Command, CommandError, CommandResult, CommandSource, Payload};
pub use router::{CommandHandler, CommandRouter, DispatchHandle, MQTT_PUBLISH_ACTION};
