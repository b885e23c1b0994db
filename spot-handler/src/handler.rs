use std::future::Future;

use spot_handler_kubeapi::NodePatchError;
use spot_handler_metadata::MetadataChecker;
use spot_handler_metadata::MetadataError;
use spot_handler_mothership::CloudEventReporter;
use spot_handler_mothership::CloudEventRequest;
use spot_handler_mothership::EventType;
use spot_handler_mothership::ReportError;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;

use k8s::NodeExt as _;

use super::*;

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Bound for the metadata checks and node reads of a poll tick, and separately for the drain patch.
///
/// Sending a cloud event is bounded by the reporter's own retry budget instead, so
/// slow mothership failures cannot eat the time the drain patch needs.
pub(crate) const ITERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with interruption polling after an interruption was detected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum InterruptionPolicy {
    /// Stop polling after the first detection, whatever the outcome.
    #[default]
    StopOnDetection,
    /// Keep polling until the interruption reached the mothership.
    RetryUntilReported,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HandlerError {
    #[error("checking metadata: {0}")]
    Metadata(#[from] MetadataError),
    #[error("getting node: {0}")]
    GetNode(#[from] kube::Error),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Patch(#[from] NodePatchError),
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Polling,
    Draining { deadline: Instant },
    Terminated,
}

#[derive(Debug)]
struct HandlerState {
    phase: Phase,
    grace_period: Duration,
    rebalance_sent: bool,
}

impl HandlerState {
    fn new(grace_period: Duration) -> Self {
        Self {
            phase: Phase::Polling,
            grace_period,
            rebalance_sent: false,
        }
    }

    fn is_polling(&self) -> bool {
        self.phase == Phase::Polling
    }

    fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    fn deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Draining { deadline } => Some(deadline),
            Phase::Polling | Phase::Terminated => None,
        }
    }

    /// Arms the grace deadline. Only the first call has an effect.
    fn begin_draining(&mut self) {
        if self.is_polling() {
            let deadline = Instant::now() + self.grace_period;
            self.phase = Phase::Draining { deadline };
            tracing::info!(grace_period = ?self.grace_period, "Shutdown requested, polling until the grace period elapses");
        }
    }

    fn terminate(&mut self) {
        self.phase = Phase::Terminated;
    }
}

#[derive(Debug)]
enum InterruptionOutcome {
    Drained,
    AlreadyUnschedulable,
    NotReported(HandlerError),
    DrainFailed(HandlerError),
}

impl InterruptionOutcome {
    fn stops_polling(&self, policy: InterruptionPolicy) -> bool {
        !matches!(
            (policy, self),
            (InterruptionPolicy::RetryUntilReported, Self::NotReported(_))
        )
    }
}

#[derive(Debug)]
struct PollOutcome {
    interruption: Option<InterruptionOutcome>,
    rebalance_sent: bool,
}

enum Wakeup {
    Tick,
    Cancelled,
    GraceElapsed,
}

/// Watches the instance metadata for the end of this node and reports it.
///
/// An interruption is reported to the mothership and then the node is cordoned,
/// labelled and tainted. A rebalance recommendation is only reported. After the
/// shutdown token is cancelled polling carries on for the grace period.
#[derive(Debug)]
pub(crate) struct SpotHandler {
    kubeapi: KubeApi,
    reporter: Box<dyn CloudEventReporter>,
    checker: Box<dyn MetadataChecker>,
    node_name: String,
    poll_interval: Duration,
    grace_period: Duration,
    iteration_timeout: Duration,
    policy: InterruptionPolicy,
}

impl SpotHandler {
    pub(crate) fn new(
        kubeapi: KubeApi,
        reporter: Box<dyn CloudEventReporter>,
        checker: Box<dyn MetadataChecker>,
        node_name: impl ToString,
    ) -> Self {
        Self {
            kubeapi,
            reporter,
            checker,
            node_name: node_name.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            iteration_timeout: ITERATION_TIMEOUT,
            policy: InterruptionPolicy::default(),
        }
    }

    pub(crate) fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub(crate) fn with_grace_period(self, grace_period: Duration) -> Self {
        Self {
            grace_period,
            ..self
        }
    }

    pub(crate) fn with_policy(self, policy: InterruptionPolicy) -> Self {
        Self { policy, ..self }
    }

    #[cfg(test)]
    fn with_iteration_timeout(self, iteration_timeout: Duration) -> Self {
        Self {
            iteration_timeout,
            ..self
        }
    }

    /// Polls until `shutdown` is cancelled and the grace period has elapsed.
    pub(crate) async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            node = %self.node_name,
            poll_interval = ?self.poll_interval,
            policy = ?self.policy,
            "Polling for spot interruptions"
        );

        let mut state = HandlerState::new(self.grace_period);
        let mut ticker = Some(self.ticker());

        while !state.is_terminated() {
            let polling = state.is_polling();
            let deadline = state.deadline();
            let wakeup = tokio::select! {
                () = next_tick(&mut ticker) => Wakeup::Tick,
                () = shutdown.cancelled(), if polling => Wakeup::Cancelled,
                () = grace_elapsed(deadline) => Wakeup::GraceElapsed,
            };

            match wakeup {
                Wakeup::Tick => match self.poll_observing_shutdown(&mut state, &shutdown).await {
                    Some(outcome) => {
                        state.rebalance_sent = outcome.rebalance_sent;
                        let stop = outcome
                            .interruption
                            .is_some_and(|interruption| self.settle_interruption(interruption));
                        if stop {
                            ticker = None;
                        }
                    }
                    None => state.terminate(),
                },
                Wakeup::Cancelled => state.begin_draining(),
                Wakeup::GraceElapsed => state.terminate(),
            }
        }

        tracing::info!(node = %self.node_name, "Grace period elapsed, stopped polling");
    }

    fn ticker(&self) -> Interval {
        let start = Instant::now() + self.poll_interval;
        let mut ticker = tokio::time::interval_at(start, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Runs one poll while still arming the grace deadline on cancellation.
    ///
    /// Returns `None` when the grace deadline elapsed before the poll finished.
    async fn poll_observing_shutdown(
        &self,
        state: &mut HandlerState,
        shutdown: &CancellationToken,
    ) -> Option<PollOutcome> {
        let poll = self.poll_once(state.rebalance_sent);
        tokio::pin!(poll);

        loop {
            let polling = state.is_polling();
            let deadline = state.deadline();
            tokio::select! {
                outcome = &mut poll => return Some(outcome),
                () = shutdown.cancelled(), if polling => state.begin_draining(),
                () = grace_elapsed(deadline) => return None,
            }
        }
    }

    async fn poll_once(&self, rebalance_sent: bool) -> PollOutcome {
        let deadline = Instant::now() + self.iteration_timeout;

        let interruption = match bounded(
            deadline,
            "checking interruption",
            self.checker.check_interrupt(),
        )
        .await
        {
            Ok(true) => {
                tracing::info!(node = %self.node_name, "Spot interruption notice received");
                Some(self.handle_interruption(deadline).await)
            }
            Ok(false) => None,
            Err(err) => {
                tracing::warn!(?err, "Checking for interruption failed");
                None
            }
        };

        let rebalance_sent = rebalance_sent || self.poll_rebalance(deadline).await;

        PollOutcome {
            interruption,
            rebalance_sent,
        }
    }

    async fn handle_interruption(&self, deadline: Instant) -> InterruptionOutcome {
        let node = match self.report(EventType::Interrupted, deadline).await {
            Ok(node) => node,
            Err(err) => return InterruptionOutcome::NotReported(err),
        };

        if node.is_unschedulable() {
            return InterruptionOutcome::AlreadyUnschedulable;
        }

        let drain = self.kubeapi.patch_node(&node, |draft| {
            draft.mark_draining(k8s::DRAINING_REASON_INTERRUPTED);
        });
        let deadline = Instant::now() + self.iteration_timeout;
        match bounded(deadline, "patching node", drain).await {
            Ok(_) => InterruptionOutcome::Drained,
            Err(err) => InterruptionOutcome::DrainFailed(err),
        }
    }

    /// Checks for a rebalance recommendation and reports it.
    ///
    /// Returns whether a recommendation was seen, even if reporting it failed.
    async fn poll_rebalance(&self, deadline: Instant) -> bool {
        let recommended = bounded(
            deadline,
            "checking rebalance recommendation",
            self.checker.check_rebalance_recommendation(),
        )
        .await;

        match recommended {
            Ok(true) => {
                tracing::info!(node = %self.node_name, "Rebalance recommendation notice received");
                if let Err(err) = self.report(EventType::RebalanceRecommendation, deadline).await {
                    tracing::error!(node = %self.node_name, ?err, "Reporting rebalance recommendation failed");
                }
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::warn!(?err, "Checking for rebalance recommendation failed");
                false
            }
        }
    }

    /// Reads the node and reports `event_type` for it. Returns the node as read.
    ///
    /// Only the read is bounded by `deadline`. The report gets the reporter's full budget.
    async fn report(
        &self,
        event_type: EventType,
        deadline: Instant,
    ) -> Result<corev1::Node, HandlerError> {
        let node = bounded(
            deadline,
            "getting node",
            self.kubeapi.get_node(&self.node_name),
        )
        .await?;

        let request = CloudEventRequest::for_node(event_type, &node);
        if request.node_id.is_empty() {
            tracing::warn!(node = %self.node_name, label = k8s::NODE_ID_LABEL, "Node has no node id label");
        }

        let deadline = Instant::now() + self.reporter.budget();
        bounded(
            deadline,
            "sending cloud event",
            self.reporter.send_cloud_event(&request),
        )
        .await?;

        tracing::info!(
            node = %self.node_name,
            event_type = %request.event_type,
            node_id = %request.node_id,
            provider_id = ?request.provider_id,
            "Cloud event reported"
        );
        Ok(node)
    }

    /// Logs the interruption outcome and tells whether interruption polling should stop.
    fn settle_interruption(&self, outcome: InterruptionOutcome) -> bool {
        let node = self.node_name.as_str();
        match &outcome {
            InterruptionOutcome::Drained => {
                tracing::info!(node, "Node marked as draining");
            }
            InterruptionOutcome::AlreadyUnschedulable => {
                tracing::info!(node, "Node is already unschedulable");
            }
            InterruptionOutcome::NotReported(err) => {
                tracing::error!(node, ?err, "Reporting interruption failed");
            }
            InterruptionOutcome::DrainFailed(err) => {
                tracing::error!(node, ?err, "Marking node as draining failed");
            }
        }

        let stop = outcome.stops_polling(self.policy);
        if stop {
            tracing::info!(node, "Interruption handled, no longer polling for interruptions");
        }
        stop
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn grace_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn bounded<T, E>(
    deadline: Instant,
    operation: &'static str,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, HandlerError>
where
    HandlerError: From<E>,
{
    match tokio::time::timeout_at(deadline, future).await {
        Ok(result) => result.map_err(HandlerError::from),
        Err(_) => Err(HandlerError::Timeout { operation }),
    }
}
