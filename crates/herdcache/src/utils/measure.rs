use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MeasureState {
    Pending,
    Done(&'static str),
}

/// Reports the duration of a computation when dropped.
///
/// The `status` tag is `ok` or `error` when marked [`done`](Self::done), and `canceled` if the
/// guard is dropped before that, for example because the computation panicked.
#[derive(Debug)]
pub struct MeasureComputationGuard {
    state: MeasureState,
    task_name: &'static str,
    creation_time: Instant,
}

impl MeasureComputationGuard {
    pub fn new(task_name: &'static str) -> Self {
        Self {
            state: MeasureState::Pending,
            task_name,
            creation_time: Instant::now(),
        }
    }

    /// Marks the computation as terminated.
    pub fn done<T, E>(mut self, result: &Result<T, E>) {
        self.state = MeasureState::Done(match result {
            Ok(_) => "ok",
            Err(_) => "error",
        });
    }
}

impl Drop for MeasureComputationGuard {
    fn drop(&mut self) {
        let status = match self.state {
            MeasureState::Pending => "canceled",
            MeasureState::Done(status) => status,
        };
        metric!(
            timer(self.task_name) = self.creation_time.elapsed(),
            "status" => status,
        );
    }
}
