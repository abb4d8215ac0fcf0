//! Periodic refresh pipeline.
//!
//! One scheduling task owns the timer, the command channel and the pipeline
//! state. A refresh cycle takes the pipeline by value, runs its blocking work
//! off the scheduler, and hands the pipeline back together with the snapshot,
//! so two cycles can never touch the CPU baseline at the same time. The
//! pipeline comes back even when the blocking work panics; a failed cycle
//! never stops the timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::Instrument;

use crate::config::Config;
use crate::system::filter::FilterContext;
use crate::system::network::{NetworkConnectionRecord, count_connections, fetch_connections};
use crate::system::sampler::Sampler;
use crate::system::snapshot::SystemSnapshot;
use crate::system::source::{ProcessSource, SocketSource};

const MIN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorOptions {
    pub interval: Duration,
    pub count_connections: bool,
    pub workers_per_core: usize,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        MonitorOptions {
            interval: Duration::from_secs(5),
            count_connections: true,
            workers_per_core: 2,
        }
    }
}

impl MonitorOptions {
    pub fn from_config(config: &Config) -> Self {
        MonitorOptions {
            interval: Duration::from_millis(config.general.refresh_interval_ms),
            count_connections: config.connections.count_on_refresh,
            workers_per_core: config.connections.workers_per_core.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    RefreshNow,
    SetInterval(Duration),
    Pause,
    Resume,
    Stop,
}

/// Handle to a running refresh loop. Must be started inside a tokio runtime.
pub struct Monitor {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Arc<SystemSnapshot>>,
    sockets: Arc<dyn SocketSource>,
}

impl Monitor {
    /// Spawn the scheduling task. The first refresh starts immediately.
    pub fn start<S>(
        source: S,
        sockets: Arc<dyn SocketSource>,
        context: FilterContext,
        options: MonitorOptions,
    ) -> Self
    where
        S: ProcessSource + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(SystemSnapshot::default()));

        let sampler = Sampler::new(source);
        let workers = options.workers_per_core.max(1) * sampler.cores();
        let pipeline = Pipeline {
            sampler: Arc::new(Mutex::new(sampler)),
            sockets: Arc::clone(&sockets),
            context,
            count_connections: options.count_connections,
            workers,
            sequence: 0,
        };

        tracing::debug!(
            interval_ms = options.interval.as_millis() as u64,
            workers,
            count_connections = options.count_connections,
            "starting monitor"
        );
        tokio::spawn(run(pipeline, command_rx, snapshot_tx, options.interval));

        Monitor {
            commands: command_tx,
            snapshots: snapshot_rx,
            sockets,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SystemSnapshot>> {
        self.snapshots.clone()
    }

    /// Most recently published snapshot; a sequence-0 placeholder before the
    /// first cycle completes.
    pub fn latest(&self) -> Arc<SystemSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    /// Ask for a cycle now. Coalesced into the current one if a cycle is running.
    pub fn refresh_now(&self) {
        self.send(Command::RefreshNow);
    }

    /// Restart the timer with a new period; the next tick fires immediately.
    pub fn set_interval(&self, interval: Duration) {
        self.send(Command::SetInterval(interval));
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Cancel the timer. Returns immediately; blocking work of a cycle already
    /// running finishes in the background and its result is dropped.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Decoded sockets of one process, fetched on the blocking pool.
    pub async fn connections(&self, pid: u32) -> Vec<NetworkConnectionRecord> {
        let sockets = Arc::clone(&self.sockets);
        match tokio::task::spawn_blocking(move || fetch_connections(&*sockets, pid)).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(pid, error = %err, "connection fetch failed");
                Vec::new()
            }
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!(?command, "monitor already stopped");
        }
    }
}

struct Pipeline<S> {
    sampler: Arc<Mutex<Sampler<S>>>,
    sockets: Arc<dyn SocketSource>,
    context: FilterContext,
    count_connections: bool,
    workers: usize,
    sequence: u64,
}

type Cycle<S> = BoxFuture<'static, (Pipeline<S>, Option<SystemSnapshot>)>;

impl<S> Pipeline<S>
where
    S: ProcessSource + Send + 'static,
{
    /// One refresh. A panic while sampling publishes an empty cycle, like a
    /// failed enumeration; a panic while assembling publishes nothing.
    async fn cycle(mut self) -> (Self, Option<SystemSnapshot>) {
        self.sequence += 1;
        let sequence = self.sequence;
        let span = tracing::debug_span!("monitor.refresh", sequence);
        async move {
            let sampler = Arc::clone(&self.sampler);
            // The baseline is only replaced after a pass completes, so a
            // panicking source leaves the previous samples in place.
            let sampled = tokio::task::spawn_blocking(move || sampler.lock().refresh()).await;
            let records = match sampled {
                Ok(records) => records,
                Err(err) => {
                    tracing::error!(error = %err, "process sampling failed");
                    Vec::new()
                }
            };

            let counts = if self.count_connections {
                let pids = records.iter().map(|r| r.pid).collect();
                count_connections(Arc::clone(&self.sockets), pids, self.workers).await
            } else {
                HashMap::new()
            };

            let context = self.context.clone();
            let assembled = tokio::task::spawn_blocking(move || {
                SystemSnapshot::assemble(sequence, context, records, counts)
            })
            .await;

            match assembled {
                Ok(snapshot) => {
                    tracing::debug!(processes = snapshot.processes.len(), "refresh complete");
                    (self, Some(snapshot))
                }
                Err(err) => {
                    tracing::error!(error = %err, "snapshot assembly failed");
                    (self, None)
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period.max(MIN_INTERVAL));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn run<S>(
    pipeline: Pipeline<S>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    publish: watch::Sender<Arc<SystemSnapshot>>,
    period: Duration,
) where
    S: ProcessSource + Send + 'static,
{
    let mut timer = ticker(period);
    let mut paused = false;
    let mut idle = Some(pipeline);
    let mut in_flight: Option<Cycle<S>> = None;

    loop {
        tokio::select! {
            _ = timer.tick(), if !paused => start_cycle(&mut idle, &mut in_flight),
            command = commands.recv() => match command {
                Some(Command::RefreshNow) => start_cycle(&mut idle, &mut in_flight),
                Some(Command::SetInterval(period)) => timer = ticker(period),
                Some(Command::Pause) => paused = true,
                Some(Command::Resume) => {
                    if paused {
                        paused = false;
                        timer.reset_immediately();
                    }
                }
                Some(Command::Stop) | None => break,
            },
            (pipeline, snapshot) = join_in_flight(&mut in_flight) => {
                idle = Some(pipeline);
                if let Some(snapshot) = snapshot {
                    publish.send_replace(Arc::new(snapshot));
                }
            }
        }
    }

    if in_flight.is_some() {
        tracing::debug!("monitor stopped with a refresh in flight; result will be discarded");
    }
}

fn start_cycle<S>(
    idle: &mut Option<Pipeline<S>>,
    in_flight: &mut Option<Cycle<S>>,
) where
    S: ProcessSource + Send + 'static,
{
    match idle.take() {
        Some(pipeline) => *in_flight = Some(pipeline.cycle().boxed()),
        None => tracing::trace!("refresh requested during a cycle; coalesced"),
    }
}

/// Resolves when the running cycle finishes; pending forever when idle.
async fn join_in_flight<T>(cycle: &mut Option<BoxFuture<'static, T>>) -> T {
    match cycle.as_mut() {
        Some(running) => {
            let finished = running.await;
            *cycle = None;
            finished
        }
        None => std::future::pending().await,
    }
}
