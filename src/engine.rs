use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use std::time::Duration;
use tracing::{debug, info};

use crate::ai::Classifier;
use crate::config::EngineConfig;
use crate::gmail::MessageSource;
use crate::ledger::{Ledger, LedgerStore, Reconciled};
use crate::models::{ClassifiedEvent, Folder, MessageRef, Signal, Status};
use crate::pacing::Sleeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent mail: discovers new applications.
    Outbound,
    /// Inbox replies: advances existing applications.
    Inbound,
}

impl Direction {
    pub fn folder(self) -> Folder {
        match self {
            Direction::Outbound => Folder::Sent,
            Direction::Inbound => Folder::Inbox,
        }
    }

    /// The original application opens a sent thread; the latest status closes an inbox thread.
    pub fn representative(self, messages: &[MessageRef]) -> Option<&MessageRef> {
        match self {
            Direction::Outbound => messages.first(),
            Direction::Inbound => messages.last(),
        }
    }

    pub fn accepts(self, status: Status) -> bool {
        match self {
            Direction::Outbound => status == Status::Applied,
            Direction::Inbound => status != Status::Applied,
        }
    }

    pub fn accept(self, event: &ClassifiedEvent) -> Option<Signal> {
        event.resolved().filter(|signal| self.accepts(signal.status))
    }

    fn pause(self, config: &EngineConfig) -> Duration {
        match self {
            Direction::Outbound => config.outbound_pause,
            Direction::Inbound => config.inbound_pause,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub threads_scanned: usize,
    pub already_processed: usize,
    pub no_signal: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub backfilled: usize,
    pub backfill_missed: usize,
    pub marked: usize,
}

impl RunStats {
    fn record(&mut self, outcome: Reconciled) {
        match outcome {
            Reconciled::Inserted => self.inserted += 1,
            Reconciled::Updated => self.updated += 1,
            Reconciled::Unchanged => self.unchanged += 1,
        }
    }
}

pub struct Engine<'a> {
    classifier: &'a dyn Classifier,
    source: &'a dyn MessageSource,
    store: &'a dyn LedgerStore,
    sleeper: &'a dyn Sleeper,
    config: EngineConfig,
    today: NaiveDate,
}

impl<'a> Engine<'a> {
    pub fn new(
        classifier: &'a dyn Classifier,
        source: &'a dyn MessageSource,
        store: &'a dyn LedgerStore,
        sleeper: &'a dyn Sleeper,
        config: EngineConfig,
        today: NaiveDate,
    ) -> Self {
        Self {
            classifier,
            source,
            store,
            sleeper,
            config,
            today,
        }
    }

    /// One batch: every outbound thread, then every inbound thread.
    pub fn run(&self) -> Result<RunStats> {
        let records = self.store.load().context("Failed to load ledger")?;
        let mut ledger = Ledger::new(records);
        let mut stats = RunStats::default();

        for direction in [Direction::Outbound, Direction::Inbound] {
            self.process(direction, &mut ledger, &mut stats)?;
        }
        Ok(stats)
    }

    fn process(&self, direction: Direction, ledger: &mut Ledger, stats: &mut RunStats) -> Result<()> {
        let folder = direction.folder();
        let threads = self
            .source
            .search(folder, self.config.lookback_days)
            .with_context(|| format!("Failed to search {} folder", folder))?;
        info!("Scanning {} thread(s) in {}", threads.len(), folder);

        for thread_id in &threads {
            stats.threads_scanned += 1;
            let messages = self
                .source
                .fetch_thread(thread_id)
                .with_context(|| format!("Failed to fetch thread {}", thread_id))?;

            let Some(message) = direction.representative(&messages) else {
                continue;
            };
            if self.source.is_processed(message) {
                stats.already_processed += 1;
                continue;
            }

            // An inbox thread can end with our own reply, so the folder may differ from the pass.
            debug!(folder = %message.folder, message = %message.id, "Classifying {}", message.subject);
            let text = message.classifier_text(self.config.excerpt_chars);
            let event = self.classifier.classify(&text);
            let Some(signal) = direction.accept(&event) else {
                debug!(folder = %message.folder, message = %message.id, ?event, "No usable signal");
                stats.no_signal += 1;
                continue;
            };

            if direction == Direction::Inbound
                && !ledger.contains(&signal.company, &signal.role)
                && !self.backfill(&signal, ledger, stats)?
            {
                continue;
            }

            let outcome = ledger.reconcile(
                &signal.company,
                &signal.role,
                signal.status,
                "",
                None,
                self.today,
            );
            stats.record(outcome);
            if outcome.changed() {
                ledger.persist(self.store).context("Failed to save ledger")?;
            }

            self.source
                .mark_processed(std::slice::from_ref(&message.id))
                .with_context(|| format!("Failed to mark message {}", message.id))?;
            stats.marked += 1;

            self.sleeper.sleep(direction.pause(&self.config));
        }
        Ok(())
    }

    /// Recreates the missing Applied record from the first sent thread that mentions the company.
    fn backfill(&self, signal: &Signal, ledger: &mut Ledger, stats: &mut RunStats) -> Result<bool> {
        info!(
            "Searching history for original application to '{}' for role '{}'",
            signal.company, signal.role
        );
        let threads = self
            .source
            .search_sent_mentioning(&signal.company)
            .with_context(|| format!("Failed to search history for {}", signal.company))?;

        let original_thread = match threads.first() {
            Some(thread_id) => self
                .source
                .fetch_thread(thread_id)
                .with_context(|| format!("Failed to fetch thread {}", thread_id))?,
            None => Vec::new(),
        };
        let Some(original) = original_thread.first() else {
            info!("Could not find original application for '{}'", signal.company);
            stats.backfill_missed += 1;
            return Ok(false);
        };

        let outcome = ledger.reconcile(
            &signal.company,
            &signal.role,
            Status::Applied,
            "",
            Some(local_date(original.timestamp)),
            self.today,
        );
        stats.record(outcome);
        if outcome.changed() {
            ledger.persist(self.store).context("Failed to save ledger")?;
        }

        debug!(folder = %original.folder, message = %original.id, "Backfilling from {}", original.subject);
        let ids: Vec<String> = original_thread.iter().map(|m| m.id.clone()).collect();
        self.source
            .mark_processed(&ids)
            .with_context(|| format!("Failed to mark thread {}", original.thread_id))?;
        stats.marked += ids.len();
        stats.backfilled += 1;
        Ok(true)
    }
}

fn local_date(timestamp: DateTime<Utc>) -> NaiveDate {
    timestamp.with_timezone(&Local).date_naive()
}
