use crossbeam_channel::{bounded, Receiver, Sender};

/// Create a bounded multi-producer multi-consumer channel. Every inter-stage
/// queue in the pipeline is one of these — `crossbeam_channel` rather than
/// `std::sync::mpsc`/`tokio::sync::mpsc` specifically because a worker pool
/// draining one queue needs multiple consumers.
pub fn create_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    bounded(capacity)
}
