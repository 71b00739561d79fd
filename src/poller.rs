use std::time::Duration;

use log::info;

use crate::backend::JobStatus;

/// Poll interval used when the box configuration does not set one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Blocks until a backend job leaves the `Running` state.
pub struct JobPoller {
    interval: Duration,
    sleeper: Box<dyn Sleeper>,
}

impl JobPoller {
    pub fn new(interval: Duration) -> Self {
        Self::with_sleeper(interval, Box::new(ThreadSleeper))
    }

    pub fn with_sleeper(interval: Duration, sleeper: Box<dyn Sleeper>) -> Self {
        Self { interval, sleeper }
    }

    /// Polls `status` until it reports `Success` or `Failure`, sleeping one
    /// interval between polls. `what` names the job in progress messages.
    pub fn wait<F>(&self, what: &str, mut status: F) -> JobStatus
    where
        F: FnMut() -> JobStatus,
    {
        let mut current = status();
        if current == JobStatus::Running {
            info!("{what} pending");
        }
        while current == JobStatus::Running {
            self.pause();
            current = status();
        }
        current
    }

    /// Sleeps one interval. Used by loops that poll several jobs per round.
    pub fn pause(&self) {
        self.sleeper.sleep(self.interval);
    }
}

impl Default for JobPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records requested sleeps instead of blocking.
    #[derive(Clone, Default)]
    pub struct RecordingSleeper {
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingSleeper {
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
        }
    }

    pub fn instant_poller() -> (JobPoller, RecordingSleeper) {
        let sleeper = RecordingSleeper::default();
        let poller =
            JobPoller::with_sleeper(Duration::from_secs(60), Box::new(sleeper.clone()));
        (poller, sleeper)
    }
}
