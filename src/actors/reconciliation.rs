use actix::prelude::*;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::balance::ReconciliationService;

// ============================================================================
// Reconciliation Actor - Runs the balance job on a fixed interval
// ============================================================================
//
// A tick is skipped while the previous run is still going. The job itself is
// a full recompute, so a skipped or repeated tick changes nothing.
//
// ============================================================================

#[derive(Message)]
#[rtype(result = "()")]
pub struct TriggerReconciliation;

#[derive(Message)]
#[rtype(result = "Option<LastRun>")]
pub struct GetLastRun;

#[derive(Message)]
#[rtype(result = "()")]
struct RunFinished(LastRun);

#[derive(Debug, Clone, PartialEq)]
pub struct LastRun {
    pub finished_at: DateTime<Utc>,
    pub vendors: usize,
    pub error: Option<String>,
}

pub struct ReconciliationActor {
    service: Arc<ReconciliationService>,
    interval: Duration,
    running: Arc<AtomicBool>,
    last_run: Option<LastRun>,
}

impl ReconciliationActor {
    pub fn new(service: Arc<ReconciliationService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            last_run: None,
        }
    }

    fn spawn_run(&self, addr: Addr<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::debug!("Reconciliation already running, skipping tick");
            return;
        }

        let service = self.service.clone();
        let running = self.running.clone();
        actix::spawn(async move {
            let last_run = match service.run().await {
                Ok(report) => LastRun {
                    finished_at: report.completed_at,
                    vendors: report.balances.len(),
                    error: None,
                },
                Err(e) => LastRun {
                    finished_at: Utc::now(),
                    vendors: 0,
                    error: Some(e.to_string()),
                },
            };
            running.store(false, Ordering::SeqCst);
            addr.do_send(RunFinished(last_run));
        });
    }
}

impl Actor for ReconciliationActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(interval_secs = self.interval.as_secs(), "ReconciliationActor started");

        ctx.run_interval(self.interval, |act, ctx| {
            act.spawn_run(ctx.address());
        });
    }
}

impl Handler<TriggerReconciliation> for ReconciliationActor {
    type Result = ();

    fn handle(&mut self, _msg: TriggerReconciliation, ctx: &mut Self::Context) {
        self.spawn_run(ctx.address());
    }
}

impl Handler<RunFinished> for ReconciliationActor {
    type Result = ();

    fn handle(&mut self, msg: RunFinished, _: &mut Self::Context) {
        if let Some(error) = &msg.0.error {
            tracing::warn!(error = %error, "Scheduled reconciliation failed");
        }
        self.last_run = Some(msg.0);
    }
}

impl Handler<GetLastRun> for ReconciliationActor {
    type Result = MessageResult<GetLastRun>;

    fn handle(&mut self, _msg: GetLastRun, _: &mut Self::Context) -> Self::Result {
        MessageResult(self.last_run.clone())
    }
}
