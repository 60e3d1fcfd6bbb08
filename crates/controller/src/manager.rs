//! Event loop and worker pool driving the reconcilers.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Backoff, Controller, ControllerConfig, ReconcileError, WorkKey, WorkQueue};

/// Stops a running [`Manager`]; dropping it without calling `cancel` leaves it running.
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct Manager {
    controller: Controller,
    config: ControllerConfig,
    queue: Arc<WorkQueue<WorkKey>>,
}

impl Manager {
    pub fn new(controller: Controller, config: ControllerConfig) -> Self {
        let backoff = Backoff { base: config.backoff_base, max: config.backoff_max };
        let queue = Arc::new(WorkQueue::new(config.queue_cap, backoff));
        Self { controller, config, queue }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<WorkKey>> {
        &self.queue
    }

    /// Subscribe to the store, enqueue everything that exists, and start the workers.
    /// The returned task finishes once cancelled and every worker has stopped.
    pub async fn start(self) -> Result<(JoinHandle<()>, CancelHandle)> {
        let Manager { controller, config, queue } = self;
        controller.ensure_watched(Controller::static_types()).await;
        let mut deltas = controller.store().subscribe();
        let initial = controller.all_keys().await.context("priming work queue")?;
        info!(objects = initial.len(), workers = config.workers, "controller starting");
        for key in initial {
            queue.add(key);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let workers: Vec<JoinHandle<()>> = (0..config.workers)
            .map(|id| {
                tokio::spawn(worker(id, controller.clone(), Arc::clone(&queue), config.clone(), stop_rx.clone()))
            })
            .collect();

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut resync = config.resync.map(tokio::time::interval);
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("cancel requested");
                        break;
                    }
                    d = deltas.recv() => match d {
                        Ok(delta) => {
                            for key in controller.route(&delta).await {
                                queue.add(key);
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(missed = n, "change stream lagged; resyncing");
                            resync_all(&controller, &queue).await;
                        }
                        Err(RecvError::Closed) => {
                            warn!("change stream closed");
                            break;
                        }
                    },
                    _ = tick(&mut resync) => resync_all(&controller, &queue).await,
                }
            }
            queue.shutdown();
            let _ = stop_tx.send(true);
            for w in workers {
                if let Err(e) = w.await {
                    error!(error = %e, "worker panicked");
                }
            }
            info!("controller stopped");
        });
        Ok((task, CancelHandle { tx: Some(cancel_tx) }))
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn resync_all(controller: &Controller, queue: &WorkQueue<WorkKey>) {
    match controller.all_keys().await {
        Ok(keys) => {
            debug!(objects = keys.len(), "resync");
            for key in keys {
                queue.add(key);
            }
        }
        Err(e) => warn!(error = %e, "resync failed"),
    }
}

async fn worker(
    id: usize,
    controller: Controller,
    queue: Arc<WorkQueue<WorkKey>>,
    config: ControllerConfig,
    mut stop: watch::Receiver<bool>,
) {
    while let Some(key) = queue.next().await {
        let kind = key.reconciler.kind();
        let started = Instant::now();
        let result = tokio::select! {
            r = tokio::time::timeout(config.reconcile_timeout, controller.reconcile(&key)) => {
                r.unwrap_or(Err(ReconcileError::Deadline(config.reconcile_timeout)))
            }
            _ = stop.wait_for(|s| *s) => Err(ReconcileError::Cancelled),
        };
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "reconciler" => kind);
        counter!("reconcile_total", 1u64, "reconciler" => kind);
        match result {
            Ok(()) => queue.done(&key),
            Err(ReconcileError::Cancelled) => {
                debug!(worker = id, work = %key, "reconcile cancelled");
                queue.retry(&key);
                break;
            }
            Err(e) if e.is_retryable() => {
                counter!("reconcile_err", 1u64, "reconciler" => kind);
                let delay = queue.retry(&key);
                warn!(worker = id, work = %key, error = %e, retry_in_ms = delay.as_millis() as u64, "reconcile failed");
            }
            Err(e) => {
                counter!("reconcile_err", 1u64, "reconciler" => kind);
                error!(worker = id, work = %key, error = %e, "reconcile failed; not retrying");
                queue.done(&key);
            }
        }
    }
    debug!(worker = id, "worker stopped");
}
