//! Accounting engine
//!
//! Owns the ledger and the sources, and runs single cycles:
//! - `poll_peers` / `poll_sessions`: adapter -> resolver -> aggregator (-> history)
//! - `fix_period`: final poll of the day plus rollover, then pause
//! - `resume`: reopen polling for the new period
//! - `sync`: seed/prune baselines against what the sources report
//!
//! The engine is not shared by itself; the scheduler wraps it in one mutex so
//! polling, fixation and sync never interleave.

use crate::adapters::client_map::ClientMap;
use crate::adapters::openvpn::{parse_session_log, SessionRecord};
use crate::adapters::wg::parse_peer_status;
use crate::adapters::{fetch_payload, CommandSource, FileSource, SourceStatus, TextSource};
use crate::aggregator::{Aggregator, RetentionReport};
use crate::history::ConnectionHistory;
use crate::resolver::{resolve, Outcome};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use std::path::PathBuf;
use tally_common::clock::{in_quiet_window, WallClock, ZoneSetting};
use tally_common::config::{TallyConfig, Timing};
use tally_common::ledger::{
    Commit, HistoryReport, Ledger, SyncReport, META_CONFIG_ERROR, META_LAST_ERROR,
    META_LAST_POLL, META_PHASE,
};
use tally_common::{Baseline, EntityKey, RawSnapshot, Result, SourceKind, TallyError};
use tracing::{debug, info, warn};

/// Scheduler phase as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Polling,
    /// Between fixation and resumption; polls are no-ops
    Paused,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Polling => "polling",
            Phase::Paused => "paused",
        }
    }
}

/// Diagnostics kept across cycles
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub phase: Phase,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub skipped_rows: u64,
    pub resets_detected: u64,
    pub polls: u64,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Polling,
            last_poll: None,
            last_error: None,
            skipped_rows: 0,
            resets_detected: 0,
            polls: 0,
        }
    }
}

/// One session log and its protocol label
pub struct SessionFeed {
    pub protocol: String,
    pub source: Box<dyn TextSource>,
}

/// Outcome of one polling cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub paused: bool,
    pub observed: usize,
    pub credited: usize,
    pub resets: usize,
    pub skipped: usize,
    pub history: HistoryReport,
    pub retention: RetentionReport,
}

impl PollReport {
    fn paused() -> Self {
        Self {
            paused: true,
            ..Self::default()
        }
    }
}

/// Outcome of a daily fixation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloverReport {
    pub closed: NaiveDate,
    pub opened: NaiveDate,
    pub committed: usize,
    pub marked: usize,
}

/// Clients connected right now
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnlineClients {
    pub wireguard: Vec<String>,
    pub openvpn: Vec<String>,
}

struct PeerRead {
    snapshots: Vec<RawSnapshot>,
    skipped: usize,
    skipped_keys: Vec<EntityKey>,
    status: SourceStatus,
}

impl PeerRead {
    fn failures(&self) -> Vec<String> {
        match &self.status {
            SourceStatus::Failed(reason) => vec![format!("peer status: {}", reason)],
            _ => Vec::new(),
        }
    }
}

struct SessionRead {
    sessions: Vec<SessionRecord>,
    skipped: usize,
    skipped_keys: Vec<EntityKey>,
    /// Reasons of logs that were present but could not be read
    failures: Vec<String>,
    /// No log failed and at least one was read
    complete: bool,
}

/// Keys to keep during a prune, or `None` when some dropped record could
/// not be identified and pruning must wait for a clean read
fn prune_guard<'a>(
    kind: SourceKind,
    skipped: usize,
    keys: &'a [EntityKey],
) -> Option<&'a [EntityKey]> {
    if keys.len() >= skipped {
        Some(keys)
    } else {
        debug!(
            "{}: {} unidentified malformed records, not pruning baselines",
            kind.as_str(),
            skipped - keys.len()
        );
        None
    }
}

pub struct Engine {
    ledger: Ledger,
    zone: ZoneSetting,
    fix_time: NaiveTime,
    resume_time: NaiveTime,
    online_window: Duration,
    client_configs: Vec<PathBuf>,
    client_prefix: String,
    peer_source: Box<dyn TextSource>,
    session_feeds: Vec<SessionFeed>,
    aggregator: Aggregator,
    history: ConnectionHistory,
    status: EngineStatus,
}

impl Engine {
    /// Engine reading the real command and log files
    pub fn from_config(config: &TallyConfig, timing: &Timing) -> Result<Self> {
        let ledger = Ledger::open_at(&config.storage.database)?;
        let peer_source = Box::new(CommandSource {
            program: config.wireguard.command.clone(),
            args: config.wireguard.args.clone(),
        });
        let feeds = config
            .openvpn
            .logs
            .iter()
            .map(|log| SessionFeed {
                protocol: log.protocol.clone(),
                source: Box::new(FileSource {
                    path: log.path.clone(),
                }) as Box<dyn TextSource>,
            })
            .collect();
        Ok(Self::with_sources(ledger, config, timing, peer_source, feeds))
    }

    /// Engine over explicit sources
    pub fn with_sources(
        ledger: Ledger,
        config: &TallyConfig,
        timing: &Timing,
        peer_source: Box<dyn TextSource>,
        session_feeds: Vec<SessionFeed>,
    ) -> Self {
        Self {
            ledger,
            zone: timing.zone,
            fix_time: timing.fix_time,
            resume_time: timing.resume_time,
            online_window: Duration::seconds(
                i64::try_from(config.wireguard.online_window_secs).unwrap_or(i64::MAX / 1000),
            ),
            client_configs: config.wireguard.client_configs.clone(),
            client_prefix: config.openvpn.client_prefix.clone(),
            peer_source,
            session_feeds,
            aggregator: Aggregator::new(timing.zone, config.retention.daily_days),
            history: ConnectionHistory::new(config.retention.history_cap),
            status: EngineStatus::default(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn status(&self) -> &EngineStatus {
        &self.status
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }

    pub fn zone(&self) -> &ZoneSetting {
        &self.zone
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    fn read_peers(&self, now: DateTime<Utc>) -> PeerRead {
        let text = match fetch_payload(self.peer_source.as_ref()) {
            Ok(text) => text,
            Err(status) => {
                if let SourceStatus::Failed(reason) = &status {
                    warn!("Peer status read failed: {}", reason);
                }
                return PeerRead {
                    snapshots: Vec::new(),
                    skipped: 0,
                    skipped_keys: Vec::new(),
                    status,
                };
            }
        };

        let clients = ClientMap::load(&self.client_configs);
        let out = parse_peer_status(&text, now, &self.zone);
        if out.skipped > 0 {
            debug!("Peer status: skipped {} malformed peers", out.skipped);
        }
        let window = self.online_window;
        PeerRead {
            snapshots: out
                .records
                .into_iter()
                .map(|peer| peer.into_snapshot(&clients, now, window))
                .collect(),
            skipped: out.skipped,
            skipped_keys: out.skipped_keys,
            status: out.status,
        }
    }

    fn read_sessions(&self) -> SessionRead {
        let mut read = SessionRead {
            sessions: Vec::new(),
            skipped: 0,
            skipped_keys: Vec::new(),
            failures: Vec::new(),
            complete: true,
        };
        let mut any_ok = false;

        for feed in &self.session_feeds {
            match fetch_payload(feed.source.as_ref()) {
                Ok(text) => {
                    let out =
                        parse_session_log(&text, &feed.protocol, &self.client_prefix, &self.zone);
                    read.skipped += out.skipped;
                    read.skipped_keys.extend(out.skipped_keys);
                    read.sessions.extend(out.records);
                    any_ok = true;
                }
                Err(SourceStatus::Failed(reason)) => {
                    warn!("Session log {} read failed: {}", feed.protocol, reason);
                    read.failures
                        .push(format!("session log {}: {}", feed.protocol, reason));
                    read.complete = false;
                }
                Err(_) => {}
            }
        }

        read.complete &= any_ok;
        read
    }

    // ------------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------------

    /// Resolve snapshots against stored baselines, dated `date`
    fn plan_commits(&self, snapshots: &[RawSnapshot], date: NaiveDate) -> Result<(Vec<Commit>, usize)> {
        let mut commits = Vec::with_capacity(snapshots.len());
        let mut resets = 0;

        for snap in snapshots {
            let prev = self.ledger.baseline(&snap.key)?;
            let resolution = resolve(prev.as_ref(), snap, date);
            match resolution.outcome {
                Outcome::Reset => {
                    resets += 1;
                    info!(
                        "Counter reset detected for {} ({}), crediting {} received / {} sent",
                        snap.key, snap.client, resolution.delta.received, resolution.delta.sent
                    );
                }
                Outcome::NewSession => debug!("New session for {}", snap.key),
                Outcome::FirstSeen => debug!("First observation of {}", snap.key),
                Outcome::Growth => {}
            }
            commits.push(self.aggregator.plan(snap, &resolution, date));
        }
        Ok((commits, resets))
    }

    /// Apply one commit per entity; stops at the first failed write
    fn account(&mut self, snapshots: &[RawSnapshot], date: NaiveDate) -> Result<PollReport> {
        let (commits, resets) = self.plan_commits(snapshots, date)?;
        let mut report = PollReport {
            observed: snapshots.len(),
            resets,
            ..PollReport::default()
        };

        for commit in &commits {
            self.ledger.commit(commit)?;
            if commit.bucket.is_some() {
                report.credited += 1;
            }
        }
        self.status.resets_detected += resets as u64;
        Ok(report)
    }

    /// Bookkeeping after a cycle. A source that was present but failed to
    /// read is recorded as the last error, like a failed job.
    fn finish_poll(
        &mut self,
        now: DateTime<Utc>,
        report: &mut PollReport,
        failures: &[String],
    ) -> Result<()> {
        report.retention = self.aggregator.retention_pass(&mut self.ledger, now)?;
        self.status.skipped_rows += report.skipped as u64;
        self.status.last_poll = Some(now);
        self.status.polls += 1;
        self.ledger.set_meta(META_LAST_POLL, &now.to_rfc3339())?;

        if !failures.is_empty() {
            let message = failures.join("; ");
            self.ledger.set_meta(META_LAST_ERROR, &message)?;
            self.status.last_error = Some(message);
        }
        Ok(())
    }

    /// One peer-status polling cycle
    pub fn poll_peers(&mut self, now: DateTime<Utc>) -> Result<PollReport> {
        if self.status.phase == Phase::Paused {
            return Ok(PollReport::paused());
        }
        let today = self.zone.date_of(now);
        let read = self.read_peers(now);

        let mut report = self.account(&read.snapshots, today)?;
        report.skipped = read.skipped;
        self.finish_poll(now, &mut report, &read.failures())?;
        Ok(report)
    }

    /// One session-log polling cycle, including connection history
    pub fn poll_sessions(&mut self, now: DateTime<Utc>) -> Result<PollReport> {
        if self.status.phase == Phase::Paused {
            return Ok(PollReport::paused());
        }
        let today = self.zone.date_of(now);
        let read = self.read_sessions();
        let snapshots: Vec<_> = read.sessions.iter().map(|s| s.to_snapshot(now)).collect();

        let mut report = self.account(&snapshots, today)?;
        report.skipped = read.skipped;
        report.history = self.history.record(&mut self.ledger, &read.sessions)?;
        self.finish_poll(now, &mut report, &read.failures)?;
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Period boundaries
    // ------------------------------------------------------------------------

    /// Period that opens at the next resume time after `now`
    pub fn next_period(&self, now: DateTime<Utc>) -> NaiveDate {
        self.zone
            .date_of(self.zone.next_occurrence(now, self.resume_time))
    }

    /// Daily fixation: credit the day's tail traffic, fix current totals as
    /// the next period's baselines in one transaction, and pause polling
    pub fn fix_period(&mut self, now: DateTime<Utc>) -> Result<RolloverReport> {
        let closed = self.zone.date_of(now);
        let opened = self.next_period(now);

        let peers = self.read_peers(now);
        let sessions = self.read_sessions();
        let mut snapshots = peers.snapshots;
        snapshots.extend(sessions.sessions.iter().map(|s| s.to_snapshot(now)));

        let (commits, resets) = self.plan_commits(&snapshots, closed)?;
        let marked = self.ledger.rollover(&commits, opened)?;
        self.history.record(&mut self.ledger, &sessions.sessions)?;
        self.status.resets_detected += resets as u64;

        self.set_phase(Phase::Paused)?;
        info!(
            "Fixed period {}: {} entities committed, {} baselines opened for {}",
            closed,
            commits.len(),
            marked,
            opened
        );

        Ok(RolloverReport {
            closed,
            opened,
            committed: commits.len(),
            marked,
        })
    }

    /// Resume polling for the period containing `now`
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<NaiveDate> {
        let today = self.zone.date_of(now);
        if self.ledger.current_period()? != Some(today) {
            let marked = self.ledger.mark_period(today)?;
            debug!("Re-marked {} baselines for {}", marked, today);
        }
        self.set_phase(Phase::Polling)?;
        info!("Polling resumed for {}", today);
        Ok(today)
    }

    /// Decide the starting phase and reconcile a stale period marker
    pub fn startup(&mut self, now: DateTime<Utc>) -> Result<Phase> {
        let local = self.zone.local(now);
        if in_quiet_window(local.time(), self.fix_time, self.resume_time) {
            info!(
                "Started inside the fixation window ({} - {}), polling paused",
                self.fix_time.format("%H:%M"),
                self.resume_time.format("%H:%M")
            );
            self.set_phase(Phase::Paused)?;
            return Ok(Phase::Paused);
        }

        let today = local.date();
        match self.ledger.current_period()? {
            Some(period) if period != today => {
                info!("Stored period {} is stale, opening {}", period, today);
                self.ledger.mark_period(today)?;
            }
            _ => {}
        }
        self.set_phase(Phase::Polling)?;
        Ok(Phase::Polling)
    }

    // ------------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------------

    /// Seed zero baselines for newly reported entities and drop baselines of
    /// entities no source reports any more. Sources that could not be read
    /// never cause deletions, and neither do entities whose record was
    /// present but malformed.
    pub fn sync(&mut self, now: DateTime<Utc>) -> Result<SyncReport> {
        if self.status.phase == Phase::Paused {
            return Ok(SyncReport::default());
        }
        let today = self.zone.date_of(now);
        let mut total = SyncReport::default();

        let peers = self.read_peers(now);
        if peers.status.is_ok() {
            let seeds: Vec<_> = peers
                .snapshots
                .iter()
                .map(|s| Baseline::zero(s.key.clone(), today, None))
                .collect();
            let retained =
                prune_guard(SourceKind::WireGuard, peers.skipped, &peers.skipped_keys);
            let report = self
                .ledger
                .sync_baselines(SourceKind::WireGuard, &seeds, retained)?;
            total.seeded += report.seeded;
            total.removed += report.removed;
        }

        let sessions = self.read_sessions();
        if sessions.complete {
            let seeds: Vec<_> = sessions
                .sessions
                .iter()
                .map(|s| Baseline::zero(s.key(), today, Some(s.connected_since)))
                .collect();
            let retained =
                prune_guard(SourceKind::OpenVpn, sessions.skipped, &sessions.skipped_keys);
            let report = self
                .ledger
                .sync_baselines(SourceKind::OpenVpn, &seeds, retained)?;
            total.seeded += report.seeded;
            total.removed += report.removed;
        }

        if total.seeded > 0 || total.removed > 0 {
            info!(
                "Baseline sync: {} seeded, {} removed",
                total.seeded, total.removed
            );
        }
        Ok(total)
    }

    // ------------------------------------------------------------------------
    // Views and status
    // ------------------------------------------------------------------------

    /// Clients connected right now: fresh handshakes and listed sessions
    pub fn online_clients(&self, now: DateTime<Utc>) -> OnlineClients {
        let mut wireguard: Vec<String> = self
            .read_peers(now)
            .snapshots
            .into_iter()
            .filter(|s| s.online)
            .map(|s| s.client)
            .collect();
        wireguard.sort();
        wireguard.dedup();

        let mut openvpn: Vec<String> = self
            .read_sessions()
            .sessions
            .into_iter()
            .map(|s| s.client)
            .collect();
        openvpn.sort();
        openvpn.dedup();

        OnlineClients { wireguard, openvpn }
    }

    fn set_phase(&mut self, phase: Phase) -> Result<()> {
        self.status.phase = phase;
        self.ledger.set_meta(META_PHASE, phase.as_str())
    }

    /// Record a failed job; configuration errors are also surfaced in the
    /// ledger for the console
    pub fn note_failure(&mut self, err: &TallyError) {
        self.status.last_error = Some(err.to_string());
        let key = if err.is_fatal() {
            META_CONFIG_ERROR
        } else {
            META_LAST_ERROR
        };
        if let Err(e) = self.ledger.set_meta(key, &err.to_string()) {
            debug!("Could not record failure in ledger: {}", e);
        }
    }
}
