/// Single-threaded event dispatch
///
/// Daemon exits and the periodic cleanup tick are the only asynchronous
/// inputs. Producers (waiter threads, timers) hold an `EventSender`; the
/// dispatch thread drains the `EventQueue` and hands each event to the
/// managers.
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Asynchronous inputs to the mount managers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A sandboxed daemon exited; signal deaths are reported as 128 + signal
    LauncherExit { pid: i32, exit_code: i32 },
    /// Periodic sweep of empty directories under the mount root
    CleanupStaleDirectories,
}

pub type EventSender = Sender<Event>;

/// Unbounded multi-producer queue consumed by the dispatch thread
#[derive(Debug, Clone)]
pub struct EventQueue {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn post(&self, event: Event) {
        // The queue owns a receiver, so the channel cannot be disconnected.
        let _ = self.sender.send(event);
    }

    /// Next event without blocking
    pub fn try_next(&self) -> Option<Event> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Next event, waiting at most `timeout`
    pub fn next_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_delivered_in_order() {
        let queue = EventQueue::new();
        let sender = queue.sender();

        sender
            .send(Event::LauncherExit { pid: 7, exit_code: 0 })
            .unwrap();
        queue.post(Event::CleanupStaleDirectories);

        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.try_next(),
            Some(Event::LauncherExit { pid: 7, exit_code: 0 })
        );
        assert_eq!(queue.try_next(), Some(Event::CleanupStaleDirectories));
        assert_eq!(queue.try_next(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cross_thread_delivery() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        std::thread::spawn(move || {
            sender
                .send(Event::LauncherExit { pid: 42, exit_code: 36 })
                .unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(
            queue.next_timeout(Duration::from_secs(1)),
            Some(Event::LauncherExit { pid: 42, exit_code: 36 })
        );
        assert_eq!(queue.next_timeout(Duration::from_millis(10)), None);
    }
}
