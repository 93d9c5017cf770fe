//! One-shot signalling between the parts of sql-exporter.
//!
//! The exporter runs a scheduler loop and an HTTP server side by side and must
//! coordinate their shutdown. The mechanism here has two components, a
//! `Broadcaster` and a `Watcher`. The `Broadcaster` fires exactly once; every
//! `Watcher` cloned from the pair observes that single event. Dropping the
//! `Broadcaster` without firing it is treated as firing it, so no `Watcher` is
//! ever left waiting on a peer that no longer exists.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use tokio::sync::watch;
use tracing::debug;

/// Construct a `Watcher` and `Broadcaster` pair.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    let (sender, receiver) = watch::channel(false);

    let w = Watcher { receiver };
    let b = Broadcaster { sender };

    (w, b)
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that the signal has
/// fired.
pub struct Broadcaster {
    sender: watch::Sender<bool>,
}

impl Broadcaster {
    /// Send the signal through to every `Watcher`.
    ///
    /// Function will NOT block until the watchers have observed the signal.
    pub fn signal(self) {
        self.sender.send_replace(true);
        debug!(
            "signal sent to {} watchers",
            self.sender.receiver_count()
        );
    }
}

#[derive(Debug, Clone)]
/// Mechanism to watch for the signal, typically used to control shutdown.
pub struct Watcher {
    receiver: watch::Receiver<bool>,
}

impl Watcher {
    /// Receive the signal. This function will block if the signal has not
    /// already been sent.
    ///
    /// If the `Broadcaster` is dropped without signalling this function
    /// returns as if the signal had been sent.
    pub async fn recv(mut self) {
        // An error means the sender is gone, which counts as the signal.
        let _ = self.receiver.wait_for(|fired| *fired).await;
    }
}
