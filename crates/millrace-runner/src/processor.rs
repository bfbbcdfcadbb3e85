use async_trait::async_trait;
use millrace_domain::{Entry, EntryStatus};

/// The statuses a processor may hand back. `processing` is deliberately
/// unrepresentable here: an in-flight marker is the runner's to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictStatus {
    Completed,
    FailedTemporarily,
    FailedPermanently,
    /// Put the entry back in the queue for another attempt (clears the
    /// recorded error).
    Pending,
    Aborted,
}

impl VerdictStatus {
    pub(crate) fn entry_status(self) -> EntryStatus {
        match self {
            VerdictStatus::Completed => EntryStatus::Completed,
            VerdictStatus::FailedTemporarily => EntryStatus::FailedTemporarily,
            VerdictStatus::FailedPermanently => EntryStatus::FailedPermanently,
            VerdictStatus::Pending => EntryStatus::Pending,
            VerdictStatus::Aborted => EntryStatus::Aborted,
        }
    }
}

/// What a processor decided about one entry.
#[derive(Debug, Clone)]
pub struct Verdict<R> {
    pub status: VerdictStatus,
    pub output: Option<R>,
    pub error: Option<String>,
}

impl<R> Verdict<R> {
    pub fn completed(output: R) -> Self {
        Verdict {
            status: VerdictStatus::Completed,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed_temporarily(error: impl Into<String>) -> Self {
        Verdict {
            status: VerdictStatus::FailedTemporarily,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn failed_permanently(error: impl Into<String>) -> Self {
        Verdict {
            status: VerdictStatus::FailedPermanently,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn requeue() -> Self {
        Verdict {
            status: VerdictStatus::Pending,
            output: None,
            error: None,
        }
    }

    pub fn with_status(status: VerdictStatus) -> Self {
        Verdict {
            status,
            output: None,
            error: None,
        }
    }
}

/// User-supplied work function.
///
/// An `Err` is recorded as `failed_temporarily` with the rendered error; a
/// call that outlives the runner's `process_timeout` loses the race and the
/// entry is marked `aborted`, with no assumption that the work stopped.
#[async_trait]
pub trait Processor<Req, Res>: Send + Sync {
    async fn process(&self, request: Req, entry: &Entry) -> anyhow::Result<Verdict<Res>>;
}

/// Adapter for plain async closures that only need the decoded request.
pub struct FnProcessor<F>(F);

impl<F> FnProcessor<F> {
    pub fn new(f: F) -> Self {
        FnProcessor(f)
    }
}

#[async_trait]
impl<Req, Res, F, Fut> Processor<Req, Res> for FnProcessor<F>
where
    Req: Send + 'static,
    Res: 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Verdict<Res>>> + Send,
{
    async fn process(&self, request: Req, _entry: &Entry) -> anyhow::Result<Verdict<Res>> {
        (self.0)(request).await
    }
}
