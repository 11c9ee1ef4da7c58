use tokio::sync::watch;

/// Sending half of a payload-less notification, e.g. "the source connection was re-established".
pub type SignalTx = watch::Sender<()>;

/// Receiving half of a payload-less notification.
pub type SignalRx = watch::Receiver<()>;

/// Creates a new pair of [`SignalTx`] and [`SignalRx`].
///
/// The receiver starts with the initial value marked as seen, so `changed()` only resolves after
/// the first `send`.
pub fn create_signal() -> (SignalTx, SignalRx) {
    watch::channel(())
}
