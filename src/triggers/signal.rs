use super::{Control, Trigger, TriggerError};
use log::debug;
use std::sync::{atomic::AtomicU8, mpsc::Sender};

/// A trigger that shuts down the daemon on SIGINT or SIGTERM.
///
/// The first signal lets the running deploys finish, the second one exits immediately.
pub struct SignalTrigger {
    signal_count: AtomicU8,
}

impl SignalTrigger {
    pub fn new() -> SignalTrigger {
        SignalTrigger {
            signal_count: AtomicU8::new(0),
        }
    }

    #[cfg(unix)]
    fn listen_inner<I>(&self, tx: Sender<Control>, signals: I) -> Result<(), TriggerError>
    where
        I: IntoIterator<Item = i32>,
    {
        use log::{error, info};
        use std::{process, sync::atomic::Ordering, thread::sleep, time::Duration};

        for signal in signals.into_iter() {
            let previous = self.signal_count.fetch_add(1, Ordering::AcqRel);
            if previous == 0 {
                info!("Got signal {signal}, shutting down after the running deploys.");
                if tx.send(Control::Shutdown).is_err() {
                    error!("Failed shutting down with signal {signal}.");
                }
            } else {
                // Allow a little time for the clean shutdown to still happen.
                sleep(Duration::from_millis(100));
                debug!("Got signal {signal} again, exiting right now.");
                process::exit(signal);
            }
        }

        Ok(())
    }
}

impl Default for SignalTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Trigger for SignalTrigger {
    #[cfg(unix)]
    fn listen(&self, tx: Sender<Control>) -> Result<(), TriggerError> {
        use signal_hook::{
            consts::TERM_SIGNALS,
            iterator::{exfiltrator::SignalOnly, SignalsInfo},
        };

        let mut signals = SignalsInfo::<SignalOnly>::new(TERM_SIGNALS)
            .map_err(|err| TriggerError::Misconfigured(err.to_string()))?;
        debug!("Listening to shutdown signals.");
        self.listen_inner(tx, &mut signals)
    }

    #[cfg(not(unix))]
    fn listen(&self, _tx: Sender<Control>) -> Result<(), TriggerError> {
        debug!("Signal handlers are not supported on non-unix systems.");

        Ok(())
    }
}
