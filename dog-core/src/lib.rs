//! dog-core: shared building blocks for the DogRS coordination crates.
//!
//! - [`DogConfig`]: flat key/value configuration store
//! - [`Serializer`]: payload serializer boundary (JSON by default)
//! - [`MessageBus`]: publish/subscribe broadcast channel
//! - [`EventHub`]: ordered async observer registry

pub mod config;
pub mod errors;
pub mod events;
pub mod messaging;
pub mod serializer;

pub use config::{load_env, DogConfig, DogConfigSnapshot};
pub use errors::{CoreError, CoreResult};
pub use events::{EventHub, EventListener, ListenerId};
pub use messaging::{
    publish_message, subscribe_message, InMemoryMessageBus, Message, MessageBus, MessageHandler,
    NullMessageBus, Subscription,
};
pub use serializer::{JsonSerializer, Serializer};

#[cfg(feature = "msgpack")]
pub use serializer::MessagePackSerializer;
