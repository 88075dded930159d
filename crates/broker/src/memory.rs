//! An in-process broker with the queue semantics the pipeline relies on:
//! direct and topic routing, per-queue FIFO delivery, redelivery on nack,
//! and exclusive consumers. It backs the test suite and single-node runs;
//! a networked transport implements the same traits in its place.

use crate::{Consume, Delivery, Error, Exchange, ExchangeKind, Publish, Resolve};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct Broker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<&'static str, ExchangeState>,
    queues: HashMap<String, Arc<Queue>>,
}

struct ExchangeState {
    spec: Exchange,
    bindings: Vec<(String, Arc<Queue>)>,
}

struct Queue {
    name: String,
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
    consumers: Mutex<ConsumerState>,
}

#[derive(Default)]
struct ConsumerState {
    count: usize,
    exclusive: bool,
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    payload: Bytes,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently declare an exchange.
    /// Redeclaration with a different configuration is an error.
    pub fn declare(&self, exchange: &Exchange) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        match state.exchanges.get(exchange.name) {
            Some(existing) if existing.spec != *exchange => {
                Err(Error::ExchangeMismatch(exchange.name.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    exchange.name,
                    ExchangeState {
                        spec: *exchange,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Declare `exchange` and return a Publisher bound to it.
    pub fn publisher(&self, exchange: &Exchange) -> Result<Publisher, Error> {
        self.declare(exchange)?;
        Ok(Publisher {
            state: self.state.clone(),
            exchange: exchange.name,
        })
    }

    /// Declare `exchange` and bind `queue` to it under `binding_key`,
    /// creating the queue if needed.
    pub fn bind(&self, exchange: &Exchange, queue: &str, binding_key: &str) -> Result<(), Error> {
        self.declare(exchange)?;
        let mut state = self.state.lock().unwrap();

        let queue = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Queue::new(queue)))
            .clone();

        let exchange = state
            .exchanges
            .get_mut(exchange.name)
            .expect("exchange was just declared");

        let exists = exchange
            .bindings
            .iter()
            .any(|(key, bound)| key == binding_key && Arc::ptr_eq(bound, &queue));
        if !exists {
            exchange.bindings.push((binding_key.to_string(), queue));
        }
        Ok(())
    }

    /// Begin consuming `queue`, creating it if needed. Concurrent consumers
    /// of one queue share its messages; an exclusive consumer refuses (and
    /// is refused by) any other consumer until it drops.
    pub fn consume(&self, queue: &str, exclusive: bool) -> Result<Consumer, Error> {
        let mut state = self.state.lock().unwrap();

        let queue = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Queue::new(queue)))
            .clone();

        {
            let mut consumers = queue.consumers.lock().unwrap();
            if consumers.exclusive || (exclusive && consumers.count > 0) {
                return Err(Error::ExclusiveConsumer(queue.name.clone()));
            }
            consumers.count += 1;
            consumers.exclusive = exclusive;
        }
        Ok(Consumer { queue, exclusive })
    }
}

#[derive(Clone)]
pub struct Publisher {
    state: Arc<Mutex<State>>,
    exchange: &'static str,
}

#[async_trait::async_trait]
impl Publish for Publisher {
    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<(), Error> {
        let targets: Vec<Arc<Queue>> = {
            let state = self.state.lock().unwrap();
            let exchange = state
                .exchanges
                .get(self.exchange)
                .ok_or_else(|| Error::UnknownExchange(self.exchange.to_string()))?;

            exchange
                .bindings
                .iter()
                .filter(|(key, _)| match exchange.spec.kind {
                    ExchangeKind::Direct => key == routing_key,
                    ExchangeKind::Topic => topic_match(key, routing_key),
                })
                .map(|(_, queue)| queue.clone())
                .collect()
        };

        // A message matching no binding is dropped, as a broker would.
        for queue in targets {
            queue.push(Message {
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }
}

pub struct Consumer {
    queue: Arc<Queue>,
    exclusive: bool,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue.name)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

#[async_trait::async_trait]
impl Consume for Consumer {
    async fn next(&mut self) -> Result<Option<Delivery>, Error> {
        let message = self.queue.pop().await;

        Ok(Some(Delivery::new(
            message.routing_key.clone(),
            message.payload.clone(),
            Box::new(Resolver {
                queue: self.queue.clone(),
                message,
            }),
        )))
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let mut consumers = self.queue.consumers.lock().unwrap();
        consumers.count -= 1;
        if self.exclusive {
            consumers.exclusive = false;
        }
    }
}

struct Resolver {
    queue: Arc<Queue>,
    message: Message,
}

impl Resolve for Resolver {
    fn resolve(self: Box<Self>, ack: bool) {
        if !ack {
            let Resolver { queue, message } = *self;
            tracing::debug!(
                queue = queue.name.as_str(),
                routing_key = message.routing_key.as_str(),
                "requeueing unacknowledged delivery"
            );
            queue.requeue(message);
        }
    }
}

impl Queue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            consumers: Mutex::new(ConsumerState::default()),
        }
    }

    fn push(&self, message: Message) {
        self.messages.lock().unwrap().push_back(message);
        self.notify.notify_one();
    }

    // A nacked message returns to the head of its queue,
    // so redelivery precedes any later traffic.
    fn requeue(&self, message: Message) {
        self.messages.lock().unwrap().push_front(message);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Message {
        loop {
            if let Some(message) = self.messages.lock().unwrap().pop_front() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

// Match a dot-separated binding pattern against a routing key,
// where `*` matches exactly one word and `#` matches zero or more.
fn topic_match(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
