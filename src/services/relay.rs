use crate::services::worker::QueueHandle;

type Consumer<T> = Box<dyn Fn(T) -> bool + Send + Sync>;

/// Zero-buffer fan-out: every item pushed in is handed to every connected
/// consumer, in arrival order per producer.
///
/// A relay has no queue or thread of its own and is not a
/// [`Task`](crate::services::worker::Task), so it can never be scheduled as one.
pub struct Relay<T> {
    consumers: Vec<Consumer<T>>,
}

impl<T> Default for Relay<T> {
    fn default() -> Self {
        Self {
            consumers: Vec::new(),
        }
    }
}

impl<T: Clone + Send + 'static> Relay<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, consumer: impl Fn(T) -> bool + Send + Sync + 'static) {
        self.consumers.push(Box::new(consumer));
    }

    /// Feed a worker's queue.
    pub fn connect_queue(&mut self, queue: QueueHandle<T>) {
        self.connect(move |item| queue.enqueue(item));
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Forward `item` to every consumer. Returns how many accepted it.
    pub fn send(&self, item: T) -> usize {
        let Some((last, rest)) = self.consumers.split_last() else {
            return 0;
        };
        let accepted = rest.iter().filter(|consume| consume(item.clone())).count();
        accepted + usize::from(last(item))
    }
}
