//! Lifecycle sweeper with start/stop hooks.
//!
//! Three independent periodic tasks:
//! - expire: ACTIVE rows past their end become EXPIRED (hourly)
//! - reminder: rows ending within the window get one reminder per UTC day (daily)
//! - renewal: auto-renew rows ending within the window are charged and extended (daily)
//!
//! A failing row is logged and counted; it never aborts the rest of the batch.

use crate::clock::Clock;
use crate::config::{chrono_window, GateConfig};
use crate::ledger::lifecycle::SubscriptionLedger;
use crate::notify::messages;
use crate::protocol::models::{Subscription, SubscriptionId};
use crate::sweeper::payment::PaymentGateway;
use crate::GateError;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Named background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepTask {
    /// Expire lapsed subscriptions.
    Expire,
    /// Remind subjects whose subscription ends soon.
    Reminder,
    /// Charge and extend auto-renew subscriptions.
    Renewal,
}

impl fmt::Display for SweepTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SweepTask::Expire => "expire",
            SweepTask::Reminder => "reminder",
            SweepTask::Renewal => "renewal",
        })
    }
}

/// Counts from one sweep run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Which sweep ran.
    pub task: SweepTask,
    /// Rows selected by the sweep query.
    pub examined: usize,
    /// Rows transitioned or notified.
    pub affected: usize,
    /// Rows whose processing failed.
    pub failed: usize,
}

impl SweepReport {
    fn new(task: SweepTask, examined: usize) -> Self {
        Self {
            task,
            examined,
            affected: 0,
            failed: 0,
        }
    }

    fn log(&self) {
        if self.failed > 0 && self.affected == 0 {
            error!(
                task = %self.task,
                examined = self.examined,
                failed = self.failed,
                "sweep failed for every processed row"
            );
        } else {
            info!(
                task = %self.task,
                examined = self.examined,
                affected = self.affected,
                failed = self.failed,
                "sweep finished"
            );
        }
    }
}

/// Runs the lifecycle sweeps against a ledger.
pub struct LifecycleSweeper {
    ledger: SubscriptionLedger,
    payments: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    sweep_timeout: Duration,
    expire_interval: Duration,
    reminder_interval: Duration,
    renewal_interval: Duration,
    reminder_window: chrono::Duration,
    renewal_window: chrono::Duration,
    reminded: Mutex<HashMap<SubscriptionId, NaiveDate>>,
}

impl LifecycleSweeper {
    /// Sweeper over a ledger, with cadence and windows from `config`.
    pub fn new(
        ledger: SubscriptionLedger,
        payments: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: &GateConfig,
    ) -> Result<Self, GateError> {
        config.validate()?;
        Ok(Self {
            ledger,
            payments,
            clock,
            sweep_timeout: config.sweep_timeout,
            expire_interval: config.expire_interval,
            reminder_interval: config.reminder_interval,
            renewal_interval: config.renewal_interval,
            reminder_window: chrono_window(config.expiring_soon_window)?,
            renewal_window: chrono_window(config.renewal_window)?,
            reminded: Mutex::new(HashMap::new()),
        })
    }

    /// Run one sweep by name.
    pub async fn run(&self, task: SweepTask) -> Result<SweepReport, GateError> {
        match task {
            SweepTask::Expire => self.run_expire_sweep().await,
            SweepTask::Reminder => self.run_reminder_sweep().await,
            SweepTask::Renewal => self.run_renewal_sweep().await,
        }
    }

    /// Expire every ACTIVE row whose end has passed.
    pub async fn run_expire_sweep(&self) -> Result<SweepReport, GateError> {
        let deadline = Instant::now() + self.sweep_timeout;
        let rows = self.ledger.due_for_expiry().await?;
        let mut report = SweepReport::new(SweepTask::Expire, rows.len());

        for row in &rows {
            if past(deadline, report.task) {
                break;
            }
            match self.ledger.expire(row).await {
                Ok(true) => report.affected += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(subscription_id = row.id, error = %e, "failed to expire subscription");
                    report.failed += 1;
                }
            }
        }

        report.log();
        Ok(report)
    }

    /// Remind subjects whose subscription ends within the window.
    ///
    /// A row is reminded at most once per UTC day.
    pub async fn run_reminder_sweep(&self) -> Result<SweepReport, GateError> {
        let deadline = Instant::now() + self.sweep_timeout;
        let rows = self.ledger.expiring_within(self.reminder_window).await?;
        let mut report = SweepReport::new(SweepTask::Reminder, rows.len());
        let now = self.clock.now_utc();
        let today = now.date_naive();

        for row in &rows {
            if past(deadline, report.task) {
                break;
            }
            if !self.claim_reminder(row.id, today)? {
                continue;
            }
            let days_left = row.days_left(now);
            self.ledger.notify(&row.subject, messages::expiring_soon(days_left));
            report.affected += 1;
        }

        report.log();
        Ok(report)
    }

    /// Charge and extend auto-renew rows ending within the window.
    ///
    /// A declined charge leaves the row as it was and tells the subject.
    pub async fn run_renewal_sweep(&self) -> Result<SweepReport, GateError> {
        let deadline = Instant::now() + self.sweep_timeout;
        let rows = self.ledger.renewal_candidates(self.renewal_window).await?;
        let mut report = SweepReport::new(SweepTask::Renewal, rows.len());

        for row in &rows {
            if past(deadline, report.task) {
                break;
            }
            match self.renew_one(row).await {
                Ok(true) => report.affected += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(subscription_id = row.id, error = %e, "auto-renewal failed");
                    report.failed += 1;
                }
            }
        }

        report.log();
        Ok(report)
    }

    async fn renew_one(&self, row: &Subscription) -> Result<bool, GateError> {
        let payments = Arc::clone(&self.payments);
        let renewed = self
            .ledger
            .renew(row, self.renewal_window, move |current| {
                payments.charge(
                    &current.subject,
                    current.plan,
                    current.payment_method.as_deref(),
                )
            })
            .await?;
        Ok(renewed.is_some())
    }

    /// Record today's reminder for a row; `false` if already sent today.
    fn claim_reminder(&self, id: SubscriptionId, today: NaiveDate) -> Result<bool, GateError> {
        let mut reminded = self
            .reminded
            .lock()
            .map_err(|_| GateError::TransientStorage("reminder log poisoned".to_string()))?;
        reminded.retain(|_, day| *day >= today);
        if reminded.get(&id) == Some(&today) {
            return Ok(false);
        }
        reminded.insert(id, today);
        Ok(true)
    }

    /// Spawn the three periodic tasks on the current tokio runtime.
    ///
    /// Each task runs its sweep once immediately, then on its interval.
    pub fn start(self: Arc<Self>) -> SweeperHandle {
        let (shutdown, signal) = watch::channel(false);
        let tasks = [
            (SweepTask::Expire, self.expire_interval),
            (SweepTask::Reminder, self.reminder_interval),
            (SweepTask::Renewal, self.renewal_interval),
        ]
        .into_iter()
        .map(|(task, period)| {
            tokio::spawn(sweep_loop(Arc::clone(&self), task, period, signal.clone()))
        })
        .collect();

        info!("lifecycle sweeper started");
        SweeperHandle { shutdown, tasks }
    }
}

async fn sweep_loop(
    sweeper: Arc<LifecycleSweeper>,
    task: SweepTask,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sweeper.run(task).await {
                    error!(task = %task, error = %e, "sweep could not run");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!(task = %task, "sweep task stopped");
}

fn past(deadline: Instant, task: SweepTask) -> bool {
    if Instant::now() >= deadline {
        warn!(task = %task, "sweep deadline reached, leaving rest for next run");
        return true;
    }
    false
}

/// Running sweeper tasks.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signal shutdown and wait for every task to finish its current run.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sweep task ended abnormally");
            }
        }
    }
}
