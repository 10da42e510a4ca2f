//! Scheduler module: wires producers, the detector, the traceroute worker
//! and the record sink together.

mod aggregator;
mod correlator;
mod producers;

pub use aggregator::*;
pub use correlator::*;
pub use producers::*;

use crate::config::{Config, ConfigError};
use crate::detector::{Detector, DetectorEvent};
use crate::probe::ProbeError;
use crate::sink::{Record, RecordWriter, SinkError};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Capacity of the ping, DNS and detector event channels.
pub const CHANNEL_CAPACITY: usize = 256;

/// How long shutdown waits for tasks to observe the stop signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that end the monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("ping {target}: {source}")]
    Ping {
        target: String,
        #[source]
        source: ProbeError,
    },
    #[error("dns: {0}")]
    Dns(#[source] ProbeError),
    #[error("record sink: {0}")]
    Sink(#[from] SinkError),
}

/// Detector shared between the aggregator and the traceroute worker.
///
/// The lock is only held for the duration of one detector call, never
/// across an await or a sink write.
#[derive(Clone)]
pub struct SharedDetector {
    inner: Arc<Mutex<Detector>>,
}

impl SharedDetector {
    pub fn new(detector: Detector) -> Self {
        Self {
            inner: Arc::new(Mutex::new(detector)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Detector> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn process_ping(
        &self,
        target: &str,
        time: DateTime<Utc>,
        success: bool,
        rtt_ms: f64,
    ) -> Vec<DetectorEvent> {
        self.lock().process_ping(target, time, success, rtt_ms)
    }

    pub fn process_dns(&self, time: DateTime<Utc>, success: bool) {
        self.lock().process_dns(time, success)
    }

    pub fn record_traceroute(&self, target: &str, episode_id: &str) {
        self.lock().record_traceroute(target, episode_id)
    }

    pub fn active_episode_id(&self, target: &str) -> Option<String> {
        self.lock().active_episode_id(target).map(str::to_string)
    }
}

/// Turns detector events into sink records and trace requests.
pub struct Dispatcher {
    writer: RecordWriter,
    trace_tx: mpsc::Sender<TraceRequest>,
    hosts: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(
        writer: RecordWriter,
        trace_tx: mpsc::Sender<TraceRequest>,
        hosts: HashMap<String, String>,
    ) -> Self {
        Self {
            writer,
            trace_tx,
            hosts,
        }
    }

    /// Write the event's record, then request a trace if an outage just
    /// started. A full trace queue drops the request.
    pub fn dispatch(&self, event: DetectorEvent) -> Result<(), SinkError> {
        let trace = match &event {
            DetectorEvent::OutageStart(t) => Some(TraceRequest {
                host: self.hosts.get(&t.target).cloned().unwrap_or_else(|| t.target.clone()),
                target: t.target.clone(),
                episode_id: t.outage_id.clone(),
            }),
            DetectorEvent::OutageEnd(_) | DetectorEvent::OutageSummary(_) => None,
        };

        let record = Record::from(event);
        self.writer.emit(&record)?;
        tracing::info!("{} {} ({})", record.record_type(), record.target, record.outage_id);

        if let Some(request) = trace {
            match self.trace_tx.try_send(request) {
                Ok(()) => {}
                Err(TrySendError::Full(r)) => {
                    tracing::warn!("Trace queue full, dropping trace for {} ({})", r.target, r.episode_id);
                }
                Err(TrySendError::Closed(r)) => {
                    tracing::warn!("Traceroute worker gone, dropping trace for {}", r.target);
                }
            }
        }
        Ok(())
    }
}

/// The running monitor.
pub struct Monitor {
    cfg: Config,
    writer: RecordWriter,
    stop_tx: broadcast::Sender<()>,
}

impl Monitor {
    pub fn new(cfg: Config, writer: RecordWriter) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            cfg,
            writer,
            stop_tx,
        }
    }

    /// Run until `shutdown` resolves or a component fails.
    ///
    /// Either way every task is told to stop and the sink is flushed before
    /// returning.
    pub async fn run<F>(self, shutdown: F) -> Result<(), MonitorError>
    where
        F: Future<Output = ()>,
    {
        let detector = SharedDetector::new(Detector::new(self.cfg.ping.window()));

        let (ping_tx, ping_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (dns_tx, dns_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, mut events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (trace_tx, trace_rx) = mpsc::channel(TRACE_QUEUE_CAPACITY);
        let (err_tx, mut err_rx) = mpsc::channel::<MonitorError>(8);

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(run_aggregator(
            detector.clone(),
            ping_rx,
            dns_rx,
            events_tx,
            self.stop_tx.subscribe(),
        )));

        let tracer = SystemTracer {
            max_hops: self.cfg.traceroute.max_hops(),
            hop_timeout: self.cfg.traceroute.hop_timeout(),
        };
        tasks.push(tokio::spawn(run_traceroute_worker(
            Correlator::new(self.cfg.traceroute.cooldown()),
            tracer,
            detector.clone(),
            self.writer.clone(),
            trace_rx,
            err_tx.clone(),
            self.stop_tx.subscribe(),
        )));

        for target in &self.cfg.targets {
            let target = target.clone();
            let settings = self.cfg.ping.clone();
            let tx = ping_tx.clone();
            let err_tx = err_tx.clone();
            let stop_rx = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let name = target.name.clone();
                if let Err(source) = run_ping_producer(target, settings, tx, stop_rx).await {
                    let _ = err_tx.send(MonitorError::Ping { target: name, source }).await;
                }
            }));
        }
        drop(ping_tx);

        {
            let settings = self.cfg.dns.clone();
            let err_tx = err_tx.clone();
            let stop_rx = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_dns_producer(settings, dns_tx, stop_rx).await {
                    let _ = err_tx.send(MonitorError::Dns(e)).await;
                }
            }));
        }
        drop(err_tx);

        tracing::info!(
            "Monitor started: {} targets, window {}s",
            self.cfg.targets.len(),
            self.cfg.ping.window_secs
        );

        let hosts = self
            .cfg
            .targets
            .iter()
            .map(|t| (t.name.clone(), t.host.clone()))
            .collect();
        let dispatcher = Dispatcher::new(self.writer.clone(), trace_tx, hosts);

        let result = run_dispatch_loop(&dispatcher, &mut events_rx, &mut err_rx, shutdown).await;

        let _ = self.stop_tx.send(());
        drop(events_rx);
        drop(err_rx);
        drop(dispatcher);

        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!("Some tasks did not stop within {:?}", SHUTDOWN_GRACE);
        }

        let flushed = self.writer.flush();
        tracing::info!("Monitor stopped");
        result?;
        flushed?;
        Ok(())
    }
}

/// Dispatch events until `shutdown` resolves, a task reports a fatal error
/// or a record cannot be written.
async fn run_dispatch_loop<F>(
    dispatcher: &Dispatcher,
    events_rx: &mut mpsc::Receiver<DetectorEvent>,
    err_rx: &mut mpsc::Receiver<MonitorError>,
    shutdown: F,
) -> Result<(), MonitorError>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested");
                return Ok(());
            }
            Some(err) = err_rx.recv() => return Err(err),
            Some(event) = events_rx.recv() => dispatcher.dispatch(event)?,
        }
    }
}
