pub mod memory;
pub mod topology;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("exchange {0:?} is not declared")]
    UnknownExchange(String),
    #[error("exchange {0:?} is already declared with a different configuration")]
    ExchangeMismatch(String),
    #[error("queue {0:?} already has an exclusive consumer")]
    ExclusiveConsumer(String),
    #[error("broker connection lost")]
    ConnectionLost,
}

/// ExchangeKind determines how a published routing key selects bound queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key exactly.
    Direct,
    /// Routing key matches dot-separated binding patterns,
    /// where `*` matches one word and `#` matches zero or more.
    Topic,
}

/// Exchange is a declaration of a named broker exchange.
/// Declarations are idempotent: every component declares the exchanges it
/// uses on startup, and redeclaration with a different configuration fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    pub name: &'static str,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Publish sends payloads to one bound exchange.
/// Errors are transport-level and retryable: the caller decides whether to
/// surface them or to nack its inbound message for broker redelivery.
#[async_trait::async_trait]
pub trait Publish: Send + Sync {
    async fn publish(&self, routing_key: &str, payload: bytes::Bytes) -> Result<(), Error>;
}

/// Consume yields deliveries from one queue.
/// `next` pends while the queue is empty and returns None if the transport
/// closes the subscription.
#[async_trait::async_trait]
pub trait Consume: Send {
    async fn next(&mut self) -> Result<Option<Delivery>, Error>;
}

/// Resolve settles a single delivery: acknowledged and removed, or
/// negatively acknowledged and requeued for redelivery.
pub trait Resolve: Send {
    fn resolve(self: Box<Self>, ack: bool);
}

/// Delivery is one in-flight message leased to a consumer. It must be
/// resolved exactly once; dropping it unresolved counts as a nack, so a
/// consumer that crashes mid-handler leaves the message to be redelivered.
pub struct Delivery {
    pub routing_key: String,
    pub payload: bytes::Bytes,
    resolver: Option<Box<dyn Resolve>>,
}

impl Delivery {
    pub fn new(routing_key: String, payload: bytes::Bytes, resolver: Box<dyn Resolve>) -> Self {
        Self {
            routing_key,
            payload,
            resolver: Some(resolver),
        }
    }

    /// Acknowledge the delivery, removing it from its queue.
    pub fn ack(mut self) {
        if let Some(resolver) = self.resolver.take() {
            resolver.resolve(true);
        }
    }

    /// Negatively acknowledge the delivery, requeuing it for redelivery.
    pub fn nack(mut self) {
        if let Some(resolver) = self.resolver.take() {
            resolver.resolve(false);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(resolver) = self.resolver.take() {
            resolver.resolve(false);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
