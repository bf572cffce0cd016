//! Moves items from a blocking source into an event loop.
//!
//! Both processes are built around one thread that owns all mutable state
//! and handles events one at a time, in arrival order. Everything that
//! blocks (reading a device, reading a socket) runs on its own thread and
//! feeds that loop through a channel. A pump is such a thread.

use log::{info, warn};
use std::fmt::Display;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

/// Runs `source` on its own thread, turning every item into an event with
/// `wrap` and sending it to `events`.
///
/// The source ends either cleanly or with one error. Either way `finish` is
/// called with the error, if there was one, and its event is sent last. The
/// pump also stops early once the event loop has hung up.
pub fn spawn_pump<S, T, X, E, F, G>(
    name: String,
    source: S,
    events: Sender<E>,
    mut wrap: F,
    finish: G,
) -> JoinHandle<()>
where
    S: Iterator<Item = Result<T, X>> + Send + 'static,
    X: Display,
    E: Send + 'static,
    F: FnMut(T) -> E + Send + 'static,
    G: FnOnce(Option<X>) -> E + Send + 'static,
{
    thread::spawn(move || {
        let mut failure = None;
        for item in source {
            match item {
                Ok(value) => {
                    if events.send(wrap(value)).is_err() {
                        info!("{} : event loop gone, stopping.", name);
                        return;
                    }
                }
                Err(error) => {
                    warn!("{} : source failed : {}.", name, error);
                    failure = Some(error);
                    break;
                }
            }
        }

        let _ = events.send(finish(failure));
        info!("{} : terminated.", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[derive(Debug, PartialEq)]
    enum MockEvent {
        Item(i32),
        End(Option<String>),
    }

    /// Checks that every item arrives in order, followed by the end marker
    #[test]
    fn test_pump_forwards_in_order() {
        let (tx, rx) = channel();
        let source = vec![Ok::<i32, String>(1), Ok(2), Ok(3)].into_iter();

        spawn_pump("mock".to_owned(), source, tx, MockEvent::Item, MockEvent::End)
            .join()
            .unwrap();

        let events: Vec<MockEvent> = rx.iter().collect();
        assert_eq!(
            events,
            vec![
                MockEvent::Item(1),
                MockEvent::Item(2),
                MockEvent::Item(3),
                MockEvent::End(None),
            ]
        );
    }

    #[test]
    fn test_pump_stops_at_first_error() {
        let (tx, rx) = channel();
        let source = vec![Ok(1), Err("broken".to_owned()), Ok(3)].into_iter();

        spawn_pump("mock".to_owned(), source, tx, MockEvent::Item, MockEvent::End)
            .join()
            .unwrap();

        let events: Vec<MockEvent> = rx.iter().collect();
        assert_eq!(
            events,
            vec![MockEvent::Item(1), MockEvent::End(Some("broken".to_owned()))]
        );
    }

    #[test]
    fn test_pump_stops_when_loop_hangs_up() {
        let (tx, rx) = channel::<MockEvent>();
        drop(rx);
        let source = (0..).map(Ok::<i32, String>);

        // Would never return if the closed channel went unnoticed.
        spawn_pump("mock".to_owned(), source, tx, MockEvent::Item, MockEvent::End)
            .join()
            .unwrap();
    }
}
