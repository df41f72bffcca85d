use crate::{chain::Acquired, error::DataError, quote::Timeframe};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

/// Anything the [`UpdateScheduler`] can drive, typically a
/// [`FallbackChain`](crate::chain::FallbackChain).
#[async_trait]
pub trait Acquire: Send + Sync {
    async fn acquire(
        &self,
        timeframe: Timeframe,
        force_fresh: bool,
    ) -> Result<Acquired, DataError>;
}

/// Outcome of the most recently applied acquisition.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum ViewState {
    Pending,
    Ready(Acquired),
    Unavailable(DataError),
}

/// Whole, consistent price state published to readers. Replaced, never patched.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PriceView {
    /// Sequence number of the acquisition that produced this view (0 before the first result)
    pub sequence: u64,
    pub timeframe: Timeframe,
    pub state: ViewState,
}

/// Monotonic request sequencing.
///
/// Results are admitted only if they were initiated after the last applied result and after the
/// most recent cancellation, so a late response for a superseded request can never overwrite
/// newer state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGate {
    issued: u64,
    floor: u64,
    applied: u64,
}

impl SequenceGate {
    /// Issue the sequence number for a new acquisition.
    pub fn begin(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    /// Logically cancel every acquisition issued so far.
    pub fn cancel_outstanding(&mut self) {
        self.floor = self.issued + 1;
    }

    /// Determine if the result of acquisition `sequence` may be applied, recording it if so.
    pub fn admit(&mut self, sequence: u64) -> bool {
        if sequence > self.applied && sequence >= self.floor {
            self.applied = sequence;
            true
        } else {
            false
        }
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }
}

/// Commands accepted by a running [`UpdateScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerCommand {
    RefreshNow,
    SetTimeframe(Timeframe),
    SetVisible(bool),
    Stop,
}

/// Control handle of a running [`UpdateScheduler`].
///
/// Every method returns `false` if the scheduler has already stopped.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Drop any outstanding result and issue a `force_fresh` acquisition immediately.
    pub fn refresh_now(&self) -> bool {
        self.send(SchedulerCommand::RefreshNow)
    }

    pub fn set_timeframe(&self, timeframe: Timeframe) -> bool {
        self.send(SchedulerCommand::SetTimeframe(timeframe))
    }

    /// Pause ticking while the consuming view is hidden; becoming visible refreshes immediately.
    pub fn set_visible(&self, visible: bool) -> bool {
        self.send(SchedulerCommand::SetVisible(visible))
    }

    pub fn stop(&self) -> bool {
        self.send(SchedulerCommand::Stop)
    }

    fn send(&self, command: SchedulerCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

type Completion = (u64, Timeframe, Result<Acquired, DataError>);

/// Drives fixed-cadence refreshes of one price feed.
///
/// At most one scheduled refresh is in flight; a tick firing while one is outstanding is skipped,
/// not queued.
#[derive(Debug)]
pub struct UpdateScheduler<A: ?Sized> {
    acquirer: Arc<A>,
    interval: Duration,
    timeframe: Timeframe,
    visible: bool,
}

impl<A> UpdateScheduler<A>
where
    A: Acquire + ?Sized + 'static,
{
    pub fn new(acquirer: Arc<A>, interval: Duration) -> Self {
        Self {
            acquirer,
            interval,
            timeframe: Timeframe::default(),
            visible: true,
        }
    }

    pub fn with_timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = timeframe;
        self
    }

    pub fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Spawn the scheduling loop, returning its control handle, the published [`PriceView`] and
    /// the task handle.
    pub fn start(self) -> (SchedulerHandle, watch::Receiver<PriceView>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(PriceView {
            sequence: 0,
            timeframe: self.timeframe,
            state: ViewState::Pending,
        });

        let task = tokio::spawn(self.run(command_rx, view_tx));
        (SchedulerHandle { tx: command_tx }, view_rx, task)
    }

    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        view_tx: watch::Sender<PriceView>,
    ) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut gate = SequenceGate::default();
        let mut in_flight: Option<u64> = None;
        let mut timeframe = self.timeframe;
        let mut visible = self.visible;

        info!(
            interval_ms = self.interval.as_millis() as u64,
            %timeframe,
            "update scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick(), if visible => {
                    if let Some(sequence) = in_flight {
                        debug!(sequence, "refresh still in flight, skipping tick");
                        continue;
                    }
                    in_flight = Some(self.launch(&mut gate, timeframe, false, &done_tx));
                }

                command = commands.recv() => match command {
                    Some(SchedulerCommand::RefreshNow) => {
                        debug!(%timeframe, "manual refresh");
                        gate.cancel_outstanding();
                        in_flight = Some(self.launch(&mut gate, timeframe, true, &done_tx));
                        ticker.reset();
                    }
                    Some(SchedulerCommand::SetTimeframe(next)) => {
                        debug!(from = %timeframe, to = %next, "switching timeframe");
                        timeframe = next;
                        gate.cancel_outstanding();
                        in_flight = Some(self.launch(&mut gate, timeframe, false, &done_tx));
                        ticker.reset();
                    }
                    Some(SchedulerCommand::SetVisible(next)) => {
                        if next && !visible {
                            debug!(%timeframe, "view visible again, refreshing");
                            ticker.reset();
                            if in_flight.is_none() {
                                in_flight = Some(self.launch(&mut gate, timeframe, false, &done_tx));
                            }
                        }
                        visible = next;
                    }
                    Some(SchedulerCommand::Stop) | None => break,
                },

                Some((sequence, requested, result)) = done_rx.recv() => {
                    if in_flight == Some(sequence) {
                        in_flight = None;
                    }

                    if !gate.admit(sequence) {
                        debug!(sequence, applied = gate.applied(), "discarding superseded result");
                        continue;
                    }

                    // Only total exhaustion crosses into the published view
                    let state = match result {
                        Ok(acquired) => ViewState::Ready(acquired),
                        Err(error) if error.is_user_visible() => {
                            warn!(%requested, %error, "acquisition failed");
                            ViewState::Unavailable(error)
                        }
                        Err(error) => {
                            warn!(%requested, %error, "acquisition failed, keeping last view");
                            continue;
                        }
                    };

                    view_tx.send_replace(PriceView {
                        sequence,
                        timeframe: requested,
                        state,
                    });
                }
            }
        }

        info!("update scheduler stopped");
    }

    fn launch(
        &self,
        gate: &mut SequenceGate,
        timeframe: Timeframe,
        force_fresh: bool,
        done_tx: &mpsc::UnboundedSender<Completion>,
    ) -> u64 {
        let sequence = gate.begin();
        let acquirer = Arc::clone(&self.acquirer);
        let done_tx = done_tx.clone();

        tokio::spawn(async move {
            let result = AssertUnwindSafe(acquirer.acquire(timeframe, force_fresh))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    warn!(sequence, %timeframe, "acquisition panicked");
                    Err(DataError::AllSourcesExhausted)
                });

            // Receiver is gone once the scheduler stopped
            let _ = done_tx.send((sequence, timeframe, result));
        });

        sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        quote::{Direction, PriceQuote},
        source::DataSource,
    };
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockAcquirer {
        calls: Mutex<Vec<(Timeframe, bool)>>,
        delays: Mutex<VecDeque<Duration>>,
        fail: Option<DataError>,
    }

    impl MockAcquirer {
        fn with_delays(delays: impl IntoIterator<Item = u64>) -> Self {
            Self {
                delays: Mutex::new(delays.into_iter().map(Duration::from_secs).collect()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(Timeframe, bool)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Acquire for MockAcquirer {
        async fn acquire(
            &self,
            timeframe: Timeframe,
            force_fresh: bool,
        ) -> Result<Acquired, DataError> {
            let delay = {
                self.calls.lock().push((timeframe, force_fresh));
                self.delays.lock().pop_front().unwrap_or_default()
            };
            tokio::time::sleep(delay).await;

            if let Some(error) = &self.fail {
                return Err(error.clone());
            }

            Ok(Acquired {
                quote: PriceQuote {
                    price: Decimal::from(60_000),
                    absolute_change: Decimal::ONE,
                    percent_change: Decimal::ONE,
                    direction: Direction::Up,
                    timeframe,
                },
                source: DataSource::Live,
                stale: false,
                acquired_at: Utc::now(),
            })
        }
    }

    async fn sleep_secs(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[test]
    fn test_sequence_gate_admit() {
        struct TestCase {
            actions: Vec<(&'static str, u64)>,
            expected: Vec<bool>,
        }

        let tests = vec![
            TestCase {
                // TC0: in-order completion
                actions: vec![("begin", 0), ("begin", 0), ("admit", 1), ("admit", 2)],
                expected: vec![true, true],
            },
            TestCase {
                // TC1: older result arriving after newer is discarded
                actions: vec![("begin", 0), ("begin", 0), ("admit", 2), ("admit", 1)],
                expected: vec![true, false],
            },
            TestCase {
                // TC2: cancelled result is discarded even if nothing newer applied yet
                actions: vec![("begin", 0), ("cancel", 0), ("begin", 0), ("admit", 1), ("admit", 2)],
                expected: vec![false, true],
            },
            TestCase {
                // TC3: duplicate delivery is discarded
                actions: vec![("begin", 0), ("admit", 1), ("admit", 1)],
                expected: vec![true, false],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut gate = SequenceGate::default();
            let actual = test
                .actions
                .into_iter()
                .filter_map(|(action, sequence)| match action {
                    "begin" => {
                        gate.begin();
                        None
                    }
                    "cancel" => {
                        gate.cancel_outstanding();
                        None
                    }
                    _ => Some(gate.admit(sequence)),
                })
                .collect::<Vec<_>>();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skipped_while_refresh_in_flight() {
        let acquirer = Arc::new(MockAcquirer::with_delays([25]));
        let (handle, _view, task) =
            UpdateScheduler::new(Arc::clone(&acquirer), Duration::from_secs(10)).start();

        // Ticks at 10s and 20s fire while the first refresh (25s) is outstanding
        sleep_secs(22).await;
        assert_eq!(acquirer.calls().len(), 1);

        sleep_secs(13).await;
        assert_eq!(acquirer.calls().len(), 2);

        assert!(handle.stop());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_timeframe_result_discarded() {
        let acquirer = Arc::new(MockAcquirer::with_delays([20, 5]));
        let (handle, mut view, _task) =
            UpdateScheduler::new(Arc::clone(&acquirer), Duration::from_secs(600)).start();

        sleep_secs(1).await;
        handle.set_timeframe(Timeframe::OneWeek);

        view.changed().await.unwrap();
        assert_eq!(view.borrow_and_update().timeframe, Timeframe::OneWeek);

        // The 1D result lands at 20s, after the 1W result was applied
        sleep_secs(30).await;
        let current = view.borrow().clone();
        assert_eq!(current.sequence, 2);
        assert_eq!(current.timeframe, Timeframe::OneWeek);
        assert!(matches!(
            current.state,
            ViewState::Ready(acquired) if acquired.quote.timeframe == Timeframe::OneWeek
        ));
        assert_eq!(
            acquirer.calls(),
            vec![(Timeframe::OneDay, false), (Timeframe::OneWeek, false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_forces_fresh_and_drops_outstanding() {
        let acquirer = Arc::new(MockAcquirer::with_delays([20, 1]));
        let (handle, mut view, _task) =
            UpdateScheduler::new(Arc::clone(&acquirer), Duration::from_secs(600)).start();

        sleep_secs(1).await;
        assert!(handle.refresh_now());

        view.changed().await.unwrap();
        assert_eq!(view.borrow_and_update().sequence, 2);

        sleep_secs(30).await;
        assert_eq!(view.borrow().sequence, 2);
        assert_eq!(
            acquirer.calls(),
            vec![(Timeframe::OneDay, false), (Timeframe::OneDay, true)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_view_pauses_ticking() {
        let acquirer = Arc::new(MockAcquirer::default());
        let (handle, _view, _task) =
            UpdateScheduler::new(Arc::clone(&acquirer), Duration::from_secs(10)).start();

        sleep_secs(1).await;
        handle.set_visible(false);
        sleep_secs(100).await;
        assert_eq!(acquirer.calls().len(), 1);

        // Becoming visible refreshes immediately
        handle.set_visible(true);
        sleep_secs(1).await;
        assert_eq!(acquirer.calls().len(), 2);

        sleep_secs(10).await;
        assert_eq!(acquirer.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_published_as_unavailable() {
        let acquirer = Arc::new(MockAcquirer {
            fail: Some(DataError::AllSourcesExhausted),
            ..Default::default()
        });
        let (handle, mut view, task) =
            UpdateScheduler::new(Arc::clone(&acquirer), Duration::from_secs(10)).start();

        view.changed().await.unwrap();
        assert_eq!(
            view.borrow_and_update().state,
            ViewState::Unavailable(DataError::AllSourcesExhausted)
        );

        // Loop survives failures and keeps ticking
        sleep_secs(15).await;
        assert_eq!(acquirer.calls().len(), 2);

        handle.stop();
        task.await.unwrap();
        assert!(!handle.refresh_now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_failures_never_published() {
        let acquirer = Arc::new(MockAcquirer {
            fail: Some(DataError::TierTimeout {
                tier: crate::source::Tier::Rest,
                timeout_ms: 8_000,
            }),
            ..Default::default()
        });
        let (handle, view, task) =
            UpdateScheduler::new(Arc::clone(&acquirer), Duration::from_secs(10)).start();

        sleep_secs(15).await;
        assert_eq!(acquirer.calls().len(), 2);
        assert!(!view.has_changed().unwrap());
        assert_eq!(view.borrow().state, ViewState::Pending);

        handle.stop();
        task.await.unwrap();
    }
}
