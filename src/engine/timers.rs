use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    RequestExpiry,
    AutoConfirm,
    SessionEviction,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::RequestExpiry => "request_expiry",
            TimerKind::AutoConfirm => "auto_confirm",
            TimerKind::SessionEviction => "session_eviction",
        }
    }
}

#[derive(Default)]
pub struct Timers {
    handles: DashMap<(TimerKind, Uuid), AbortHandle>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm<F>(&self, kind: TimerKind, id: Uuid, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(timer = kind.as_str(), id = %id, "timer fired");
            task.await;
        });

        if let Some(previous) = self.handles.insert((kind, id), handle.abort_handle()) {
            previous.abort();
        }
    }

    pub fn cancel(&self, kind: TimerKind, id: Uuid) -> bool {
        match self.handles.remove(&(kind, id)) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn forget(&self, kind: TimerKind, id: Uuid) {
        self.handles.remove(&(kind, id));
    }

    pub fn is_armed(&self, kind: TimerKind, id: Uuid) -> bool {
        self.handles
            .get(&(kind, id))
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}
