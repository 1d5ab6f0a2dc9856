use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::runtime::correlation::Resolved;
use crate::{FailureDetail, OrchestrationContext};

/// Result of a resolved durable operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, FailureDetail>),
    Timer,
    External(String),
    SubOrchestration(Result<String, FailureDetail>),
}

impl DurableOutput {
    /// The failure carried by a failed activity or sub-orchestration.
    pub fn failure(&self) -> Option<&FailureDetail> {
        match self {
            DurableOutput::Activity(Err(f)) | DurableOutput::SubOrchestration(Err(f)) => Some(f),
            _ => None,
        }
    }

    pub fn into_activity_result(self) -> Result<String, FailureDetail> {
        match self {
            DurableOutput::Activity(r) => r,
            other => Err(wrong_kind("activity", &other)),
        }
    }

    pub fn into_sub_orchestration_result(self) -> Result<String, FailureDetail> {
        match self {
            DurableOutput::SubOrchestration(r) => r,
            other => Err(wrong_kind("sub-orchestration", &other)),
        }
    }
}

fn wrong_kind(expected: &str, got: &DurableOutput) -> FailureDetail {
    FailureDetail::configuration(
        "WrongOperationKind",
        format!("expected {expected} output, got {got:?}"),
    )
}

/// Two-way race result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Either2<A, B> {
    First(A),
    Second(B),
}

/// A scheduled operation. Resolves once its resolving event is in history;
/// within a single pass an unresolved future stays pending forever.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    /// `None` when scheduling hit a nondeterminism error.
    seq: Option<u64>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, seq: u64) -> Self {
        Self { ctx, seq: Some(seq) }
    }

    pub(crate) fn poisoned(ctx: OrchestrationContext) -> Self {
        Self { ctx, seq: None }
    }

    /// Sequence number (scheduling event id) of this operation.
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    fn peek(&self) -> Option<Resolved> {
        self.ctx.peek_resolution(self.seq?)
    }

    pub fn into_activity(self) -> impl Future<Output = Result<String, FailureDetail>> + Send {
        async move { self.await.into_activity_result() }
    }

    /// Wait for a timer. Used on another kind of operation, the pass fails
    /// with a configuration error and this never resolves.
    pub fn into_timer(self) -> impl Future<Output = ()> + Send {
        let ctx = self.ctx.clone();
        async move {
            match self.await {
                DurableOutput::Timer => (),
                other => {
                    ctx.report_misuse(wrong_kind("timer", &other));
                    std::future::pending().await
                }
            }
        }
    }

    /// Wait for an external event's data. Misuse is reported like
    /// [`into_timer`](Self::into_timer).
    pub fn into_event(self) -> impl Future<Output = String> + Send {
        let ctx = self.ctx.clone();
        async move {
            match self.await {
                DurableOutput::External(data) => data,
                other => {
                    ctx.report_misuse(wrong_kind("event", &other));
                    std::future::pending().await
                }
            }
        }
    }

    pub fn into_sub_orchestration(self) -> impl Future<Output = Result<String, FailureDetail>> + Send {
        async move { self.await.into_sub_orchestration_result() }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(seq) = self.seq else {
            return Poll::Pending;
        };
        match self.ctx.take_resolution(seq) {
            Some(resolved) => Poll::Ready(resolved.output),
            None => Poll::Pending,
        }
    }
}

/// Index of the member whose resolving event comes first in history.
fn earliest(resolutions: &[Option<Resolved>], filter: impl Fn(&Resolved) -> bool) -> Option<usize> {
    resolutions
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.as_ref().filter(|r| filter(r)).map(|r| (i, r.event_id)))
        .min_by_key(|(_, event_id)| *event_id)
        .map(|(i, _)| i)
}

/// Race over a set of operations. See [`OrchestrationContext::first_of`].
pub struct FirstOfFuture {
    ctx: OrchestrationContext,
    members: Vec<DurableFuture>,
}

impl Future for FirstOfFuture {
    type Output = (usize, DurableOutput, Vec<DurableFuture>);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let resolutions: Vec<_> = this.members.iter().map(DurableFuture::peek).collect();
        let Some(winner) = earliest(&resolutions, |_| true) else {
            return Poll::Pending;
        };
        let Some(resolved) = resolutions.into_iter().nth(winner).flatten() else {
            return Poll::Pending;
        };
        this.ctx.observe(&resolved);
        let mut losers = std::mem::take(&mut this.members);
        losers.remove(winner);
        Poll::Ready((winner, resolved.output, losers))
    }
}

/// Two-way race. See [`OrchestrationContext::select2`].
pub struct SelectFuture(FirstOfFuture);

impl Future for SelectFuture {
    type Output = Either2<DurableOutput, DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll(cx).map(|(winner, output, _losers)| {
            if winner == 0 {
                Either2::First(output)
            } else {
                Either2::Second(output)
            }
        })
    }
}

/// Waits for every member. See [`OrchestrationContext::join`].
pub struct JoinFuture {
    ctx: OrchestrationContext,
    members: Vec<DurableFuture>,
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let resolutions: Option<Vec<Resolved>> = this.members.iter().map(DurableFuture::peek).collect();
        let Some(resolutions) = resolutions else {
            return Poll::Pending;
        };
        // The join is observed when its last member resolved.
        if let Some(last) = resolutions.iter().max_by_key(|r| r.event_id) {
            this.ctx.observe(last);
        }
        Poll::Ready(resolutions.into_iter().map(|r| r.output).collect())
    }
}

/// Join that surfaces failures. See [`OrchestrationContext::all_of`].
pub struct AllOfFuture {
    ctx: OrchestrationContext,
    members: Vec<DurableFuture>,
}

impl Future for AllOfFuture {
    type Output = Result<Vec<DurableOutput>, FailureDetail>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let all: Option<Vec<Resolved>> = this.members.iter().map(DurableFuture::peek).collect();
        let Some(all) = all else {
            return Poll::Pending;
        };
        if let Some(last) = all.iter().max_by_key(|r| r.event_id) {
            this.ctx.observe(last);
        }

        let mut failed: Vec<&Resolved> = all.iter().filter(|r| r.output.failure().is_some()).collect();
        failed.sort_by_key(|r| r.event_id);
        let chained = failed
            .iter()
            .rev()
            .filter_map(|r| r.output.failure())
            .fold(None, |cause: Option<FailureDetail>, failure| {
                Some(match cause {
                    Some(cause) => append_cause(failure.clone(), cause),
                    None => failure.clone(),
                })
            });
        match chained {
            Some(failure) => Poll::Ready(Err(failure)),
            None => Poll::Ready(Ok(all.into_iter().map(|r| r.output).collect())),
        }
    }
}

/// Attach `cause` at the end of `failure`'s cause chain.
fn append_cause(mut failure: FailureDetail, cause: FailureDetail) -> FailureDetail {
    failure.inner_failure = Some(Box::new(match failure.inner_failure.take() {
        Some(inner) => append_cause(*inner, cause),
        None => cause,
    }));
    failure
}

impl OrchestrationContext {
    /// Race operations against each other.
    ///
    /// The winner is the member whose resolving event appears first in
    /// history, so replay always picks the same winner. Resolves with the
    /// winner's index, its output and the losing operations, which remain
    /// outstanding; their late completions are recorded and otherwise ignored.
    pub fn first_of(&self, members: Vec<DurableFuture>) -> FirstOfFuture {
        FirstOfFuture {
            ctx: self.clone(),
            members,
        }
    }

    /// Race two operations, e.g. an activity against a timeout timer.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture(self.first_of(vec![a, b]))
    }

    /// Wait for every operation; outputs come back in argument order.
    pub fn join(&self, members: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture {
            ctx: self.clone(),
            members,
        }
    }

    /// Like [`join`](Self::join), but resolves to `Err` when any member failed.
    /// Waits for every member first. The earliest failure in history is
    /// returned with the later ones chained as its causes.
    pub fn all_of(&self, members: Vec<DurableFuture>) -> AllOfFuture {
        AllOfFuture {
            ctx: self.clone(),
            members,
        }
    }
}
