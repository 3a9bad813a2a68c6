use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
#[cfg(unix)]
use signal_hook::{flag, low_level, SigId};

#[cfg(unix)]
const SHUTDOWN_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGQUIT];

/// Latches SIGINT/SIGTERM/SIGQUIT into a flag the binary polls between
/// sleeps; the request worker itself never sees signals.
pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let sig_ids = SHUTDOWN_SIGNALS
                .iter()
                .map(|signal| flag::register(*signal, Arc::clone(&triggered)))
                .collect::<io::Result<Vec<_>>>()?;
            Ok(Self { triggered, sig_ids })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn wait(&self, poll_interval: Duration) {
        while !self.is_triggered() {
            thread::sleep(poll_interval);
        }
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            low_level::unregister(id);
        }
    }
}
