use crate::error::{EngineError, EngineResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cooperative cancellation flag shared between a job and whoever started it.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct JobStatusData {
    job: String,
    stop: StopToken,
    running: bool,
    processed: usize,
    total: usize,
    current_item: Option<String>,
    message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobStatusSnapshot {
    pub job: String,
    pub running: bool,
    pub processed: usize,
    pub total: usize,
    pub current_item: Option<String>,
    pub message: String,
}

/// Single-flight slot for one kind of long-running job (market data refresh,
/// optimization). At most one job runs at a time; status is polled.
///
/// `active` only changes while `inner` is locked, so the job name, its stop
/// token and the running flag are always published together.
#[derive(Clone, Default)]
pub struct JobSlot {
    active: Arc<AtomicBool>,
    inner: Arc<Mutex<JobStatusData>>,
}

impl JobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot or reports that another job still holds it.
    pub fn try_start<S: Into<String>>(&self, job: S, total: usize) -> EngineResult<JobHandle> {
        let job = job.into();
        let mut data = self.lock();
        if data.running {
            return Err(EngineError::AlreadyRunning {
                job: data.job.clone(),
            });
        }

        let token = StopToken::new();
        *data = JobStatusData {
            message: format!("{} started", job),
            job,
            stop: token.clone(),
            running: true,
            processed: 0,
            total,
            current_item: None,
        };
        self.active.store(true, Ordering::SeqCst);
        drop(data);

        Ok(JobHandle {
            slot: self.clone(),
            stop: token,
            finished: false,
        })
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        let data = self.lock();
        if data.running {
            data.stop.request_stop();
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobStatusData> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> JobStatusSnapshot {
        if let Ok(data) = self.inner.lock() {
            JobStatusSnapshot {
                job: data.job.clone(),
                running: data.running,
                processed: data.processed,
                total: data.total,
                current_item: data.current_item.clone(),
                message: data.message.clone(),
            }
        } else {
            JobStatusSnapshot {
                job: String::new(),
                running: self.is_running(),
                processed: 0,
                total: 0,
                current_item: None,
                message: "Status unavailable".to_string(),
            }
        }
    }
}

/// Proof of ownership of a [`JobSlot`]. Dropping it releases the slot.
pub struct JobHandle {
    slot: JobSlot,
    stop: StopToken,
    finished: bool,
}

impl JobHandle {
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn set_total(&self, total: usize) {
        if let Ok(mut data) = self.slot.inner.lock() {
            data.total = total;
        }
    }

    pub fn set_progress<S: Into<String>>(&self, processed: usize, current_item: Option<S>) {
        if let Ok(mut data) = self.slot.inner.lock() {
            data.processed = processed;
            data.current_item = current_item.map(Into::into);
        }
    }

    pub fn set_message<S: Into<String>>(&self, message: S) {
        if let Ok(mut data) = self.slot.inner.lock() {
            data.message = message.into();
        }
    }

    pub fn finish<S: Into<String>>(mut self, message: S) {
        self.release(message.into());
    }

    fn release(&mut self, message: String) {
        if self.finished {
            return;
        }
        self.finished = true;
        let mut data = self.slot.lock();
        data.running = false;
        data.current_item = None;
        data.message = message;
        self.slot.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.release("Job ended".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn second_start_is_rejected_while_running() {
        let slot = JobSlot::new();
        let handle = slot.try_start("optimize", 9).unwrap();
        let err = slot.try_start("optimize", 9).err().unwrap();
        assert_eq!(
            err,
            EngineError::AlreadyRunning {
                job: "optimize".to_string()
            }
        );
        handle.finish("done");
        assert!(!slot.is_running());
        assert!(slot.try_start("refresh", 3).is_ok());
    }

    #[test]
    fn dropping_the_handle_releases_the_slot() {
        let slot = JobSlot::new();
        {
            let _handle = slot.try_start("refresh", 1).unwrap();
            assert!(slot.status().running);
        }
        let status = slot.status();
        assert!(!status.running);
        assert!(!slot.is_running());
    }

    #[test]
    fn progress_is_visible_to_pollers() {
        let slot = JobSlot::new();
        let handle = slot.try_start("refresh", 4).unwrap();
        handle.set_progress(2, Some("AAA.PA"));
        handle.set_message("Downloading");
        let status = slot.status();
        assert_eq!(status.processed, 2);
        assert_eq!(status.total, 4);
        assert_eq!(status.current_item.as_deref(), Some("AAA.PA"));
        assert_eq!(status.message, "Downloading");
        handle.finish("Refreshed 4 tickers");
        assert_eq!(slot.status().message, "Refreshed 4 tickers");
    }

    #[test]
    fn stop_request_reaches_the_running_job() {
        let slot = JobSlot::new();
        let handle = slot.try_start("optimize", 1).unwrap();
        let token = handle.stop_token();
        assert!(!token.is_stopped());
        slot.request_stop();
        assert!(token.is_stopped());
        drop(handle);

        let next = slot.try_start("optimize", 1).unwrap();
        assert!(!next.stop_token().is_stopped());
    }

    #[test]
    fn racing_starts_report_the_winner() {
        let slot = JobSlot::new();
        slot.try_start("previous", 1).unwrap().finish("done");

        let outcomes: Vec<Result<String, EngineError>> = (0..8)
            .map(|i| {
                let slot = slot.clone();
                thread::spawn(move || {
                    let name = format!("job-{}", i);
                    slot.try_start(name.clone(), 1).map(|handle| {
                        slot.request_stop();
                        assert!(handle.stop_token().is_stopped());
                        std::mem::forget(handle);
                        name
                    })
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let winners: Vec<&String> = outcomes.iter().filter_map(|o| o.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(&slot.status().job, winners[0]);
        for outcome in &outcomes {
            if let Err(err) = outcome {
                assert_eq!(
                    err,
                    &EngineError::AlreadyRunning {
                        job: winners[0].clone()
                    }
                );
            }
        }
    }

    #[test]
    fn stop_after_release_does_not_reach_the_next_job() {
        let slot = JobSlot::new();
        slot.try_start("optimize", 1).unwrap().finish("done");
        slot.request_stop();
        let next = slot.try_start("optimize", 1).unwrap();
        assert!(!next.stop_token().is_stopped());
        assert_eq!(slot.status().job, "optimize");
    }

    #[test]
    fn concurrent_starts_admit_exactly_one() {
        let slot = JobSlot::new();
        let winners: Vec<bool> = (0..8)
            .map(|_| {
                let slot = slot.clone();
                thread::spawn(move || slot.try_start("refresh", 1).map(std::mem::forget).is_ok())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();
        assert_eq!(winners.iter().filter(|won| **won).count(), 1);
    }
}
