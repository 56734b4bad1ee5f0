use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::vastup_core::domain::{COMPLETION_MARKER, Instance, InstanceStatus};
use crate::vastup_core::error::MarketError;
use crate::vastup_core::market::MarketApi;
use crate::vastup_core::process::Cancel;
use crate::vastup_core::settings::WatchSettings;

/// Ceiling for the error-backoff ladder.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s\x22']+").expect("url regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    /// No successful fetch yet; the marker baseline is still unknown.
    Initializing,
    /// Healthy polling, printing new log lines as they appear.
    Streaming,
    /// One or more consecutive API errors; sleeping on the backoff ladder.
    BackingOff,
    /// Completion observed and the instance stopped; still polling so the
    /// operator can read the final tail. Only an interrupt ends this.
    TerminalPendingInterrupt,
}

/// What the poll loop learned this tick.
#[derive(Debug)]
pub struct TickOutcome {
    /// Log lines not shown before, in order.
    pub new_lines: Vec<String>,
    /// True exactly once, on the tick whose new lines pushed the marker
    /// count past the baseline.
    pub completed_now: bool,
    /// Status-change message to surface, if the instance moved.
    pub status_change: Option<String>,
}

/// Final report when the watcher is interrupted.
#[derive(Debug, Clone)]
pub struct WatchReport {
    pub instance_id: u64,
    pub completed: bool,
    pub result_url: Option<String>,
    pub last_status: Option<InstanceStatus>,
}

/// Per-instance watcher state machine. All transitions are driven by polled
/// events (`observe_*`); the blocking loop around it lives in
/// [`watch_instance`].
pub struct WatcherState {
    instance_id: u64,
    phase: WatchPhase,
    /// Completion markers already present in the log at first fetch. The
    /// log API returns the instance's cumulative tail, which can contain
    /// markers from previous container restarts; only a count strictly
    /// greater than this baseline signals success.
    baseline: Option<usize>,
    markers_seen: usize,
    shown: Vec<String>,
    consecutive_errors: u32,
    poll_interval: Duration,
    /// Substring a result URL must contain (the output bucket name).
    url_filter: String,
    result_url: Option<String>,
    completed: bool,
    last_status: Option<InstanceStatus>,
}

impl WatcherState {
    pub fn new(instance_id: u64, poll_interval: Duration, url_filter: impl Into<String>) -> Self {
        Self {
            instance_id,
            phase: WatchPhase::Initializing,
            baseline: None,
            markers_seen: 0,
            shown: Vec::new(),
            consecutive_errors: 0,
            poll_interval,
            url_filter: url_filter.into(),
            result_url: None,
            completed: false,
            last_status: None,
        }
    }

    pub fn phase(&self) -> WatchPhase {
        self.phase
    }

    pub fn result_url(&self) -> Option<&str> {
        self.result_url.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Feed one successful poll (instance lookup + log tail). Resets the
    /// error ladder, establishes the baseline on the first call, diffs the
    /// tail, and detects completion.
    pub fn observe_poll(&mut self, instance: Option<&Instance>, tail: &str) -> TickOutcome {
        let recovered = self.consecutive_errors > 0;
        self.consecutive_errors = 0;
        if recovered {
            tracing::info!(
                "instance {}: log API recovered, resuming normal polling",
                self.instance_id
            );
        }

        let status_change = self.note_status(instance);

        let lines: Vec<String> = tail.lines().map(str::to_string).collect();

        let Some(baseline) = self.baseline else {
            // First successful fetch: whatever markers the cumulative tail
            // already carries (previous container restarts) become the
            // baseline and must not count as fresh. The whole window is new
            // to the operator.
            self.baseline = Some(count_markers_in(&lines));
            self.markers_seen = count_markers_in(&lines);
            self.phase = WatchPhase::Streaming;
            self.shown = lines.clone();
            return TickOutcome {
                new_lines: lines,
                completed_now: false,
                status_change,
            };
        };

        if self.phase != WatchPhase::TerminalPendingInterrupt {
            self.phase = WatchPhase::Streaming;
        }
        let new_lines = diff_new_lines(&self.shown, &lines);
        self.shown = lines;

        let mut completed_now = false;
        if !self.completed {
            // The tail window may have slid past historic markers, so fresh
            // arrivals are accumulated from the diffed lines only.
            self.markers_seen += count_markers_in(&new_lines);
            if self.markers_seen > baseline {
                completed_now = true;
                self.completed = true;
                self.result_url = scan_result_url(&new_lines, &self.url_filter)
                    .or_else(|| scan_result_url(&self.shown, &self.url_filter));
                self.phase = WatchPhase::TerminalPendingInterrupt;
            }
        }

        TickOutcome {
            new_lines,
            completed_now,
            status_change,
        }
    }

    /// Feed one failed poll. Returns the delay before the next attempt:
    /// `min(poll_interval * 2^(errors - 1), 60s)`. Benign conditions
    /// (instance missing) do not climb the ladder.
    pub fn observe_error(&mut self, err: &MarketError) -> Duration {
        if matches!(err, MarketError::InstanceNotFound(_)) {
            // The instance may reappear (or the operator wants the tail
            // that is no longer served); keep calm and keep polling.
            tracing::warn!("instance {}: {err}; continuing to poll", self.instance_id);
            return self.poll_interval;
        }
        self.consecutive_errors += 1;
        if self.phase != WatchPhase::TerminalPendingInterrupt {
            self.phase = WatchPhase::BackingOff;
        }
        let delay = backoff_delay(self.poll_interval, self.consecutive_errors);
        tracing::warn!(
            "instance {}: poll failed ({err}); retry {} in {:?}",
            self.instance_id,
            self.consecutive_errors,
            delay
        );
        delay
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn note_status(&mut self, instance: Option<&Instance>) -> Option<String> {
        let status = instance.map(|i| i.status.clone());
        let message = match (&self.last_status, &status) {
            (previous, Some(current)) if previous.as_ref() != Some(current) => Some(format!(
                "instance {} is now {current}{}",
                self.instance_id,
                if current.is_terminal() {
                    " (continuing to poll; interrupt to detach)"
                } else {
                    ""
                }
            )),
            (Some(_), None) => Some(format!(
                "instance {} no longer reported by the provider (continuing to poll)",
                self.instance_id
            )),
            _ => None,
        };
        if status.is_some() {
            self.last_status = status;
        }
        message
    }

    pub fn report(&self) -> WatchReport {
        WatchReport {
            instance_id: self.instance_id,
            completed: self.completed,
            result_url: self.result_url.clone(),
            last_status: self.last_status.clone(),
        }
    }
}

pub fn backoff_delay(base: Duration, consecutive_errors: u32) -> Duration {
    let exponent = consecutive_errors.saturating_sub(1).min(16);
    (base * 2u32.saturating_pow(exponent)).min(MAX_BACKOFF)
}

fn count_markers_in(lines: &[String]) -> usize {
    lines
        .iter()
        .filter(|line| line.contains(COMPLETION_MARKER))
        .count()
}

/// The log API serves a sliding window over the cumulative log. The new
/// portion of the current window is everything after the longest prefix of
/// it that matches a suffix of the previously shown window; disjoint
/// windows (the log outran the tail) surface in full.
fn diff_new_lines(shown: &[String], current: &[String]) -> Vec<String> {
    let max_overlap = shown.len().min(current.len());
    for overlap in (1..=max_overlap).rev() {
        if shown[shown.len() - overlap..] == current[..overlap] {
            return current[overlap..].to_vec();
        }
    }
    current.to_vec()
}

/// Find the result URL in freshly logged lines: the last HTTPS URL whose
/// text mentions the output bucket.
fn scan_result_url(lines: &[String], url_filter: &str) -> Option<String> {
    lines
        .iter()
        .rev()
        .filter(|line| !line.contains(COMPLETION_MARKER))
        .find_map(|line| {
            URL_PATTERN
                .find_iter(line)
                .map(|m| m.as_str().to_string())
                .find(|url| url.contains(url_filter))
        })
}

/// Blocking per-instance supervisor.
///
/// Polls until the operator interrupts; completion stops the instance but
/// deliberately does not end the loop, so the final tail stays readable.
pub fn watch_instance(
    market: &dyn MarketApi,
    instance_id: u64,
    settings: &WatchSettings,
    url_filter: &str,
    cancel: &Cancel,
) -> WatchReport {
    let mut state = WatcherState::new(
        instance_id,
        Duration::from_secs(settings.poll_secs),
        url_filter,
    );
    tracing::info!("watching instance {instance_id} (poll every {}s)", settings.poll_secs);

    while !cancel.is_cancelled() {
        let tick = market
            .get_instance(instance_id)
            .and_then(|instance| {
                let tail = market.get_logs(instance_id, settings.tail_lines)?;
                Ok((instance, tail))
            });

        let delay = match tick {
            Ok((instance, tail)) => {
                let outcome = state.observe_poll(instance.as_ref(), &tail);
                if let Some(message) = &outcome.status_change {
                    tracing::info!("{message}");
                }
                for line in &outcome.new_lines {
                    // Operator stream: remote worker output passes through raw.
                    println!("[{instance_id}] {line}");
                }
                if outcome.completed_now {
                    match state.result_url() {
                        Some(url) => tracing::info!("instance {instance_id} completed: {url}"),
                        None => tracing::info!(
                            "instance {instance_id} completed (no result URL found in log tail)"
                        ),
                    }
                    if let Err(err) = market.stop_instance(instance_id) {
                        tracing::warn!("failed to stop instance {instance_id}: {err}");
                    } else {
                        tracing::info!("instance {instance_id} stop requested");
                    }
                }
                state.poll_interval()
            }
            Err(err) => state.observe_error(&err),
        };

        if !cancel.sleep(delay) {
            break;
        }
    }

    state.report()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::vastup_core::market::{CreateInstanceRequest, OfferFilter};

    fn running_instance(id: u64) -> Instance {
        Instance {
            instance_id: id,
            status: InstanceStatus::Running,
            gpu_model: None,
            price_per_hour: None,
        }
    }

    #[test]
    fn first_fetch_establishes_marker_baseline() {
        // Two stale markers from previous container restarts must not count.
        let stale_tail = format!(
            "boot\n{COMPLETION_MARKER}\nrestart\n{COMPLETION_MARKER}\nworking"
        );
        let mut state = WatcherState::new(1, Duration::from_secs(5), "videos");
        let outcome = state.observe_poll(Some(&running_instance(1)), &stale_tail);
        assert!(!outcome.completed_now);
        assert!(!state.is_completed());
        assert_eq!(state.phase(), WatchPhase::Streaming);

        // Ticks without a fresh marker stay incomplete.
        let outcome = state.observe_poll(Some(&running_instance(1)), &stale_tail);
        assert!(!outcome.completed_now);
        assert!(outcome.new_lines.is_empty());

        // The third (fresh) marker crosses the baseline: success, once.
        let done_tail = format!(
            "{stale_tail}\nhttps://storage.example.com/videos/out/a.mp4\n{COMPLETION_MARKER}"
        );
        let outcome = state.observe_poll(Some(&running_instance(1)), &done_tail);
        assert!(outcome.completed_now);
        assert!(state.is_completed());
        assert_eq!(state.phase(), WatchPhase::TerminalPendingInterrupt);
        assert_eq!(
            state.result_url(),
            Some("https://storage.example.com/videos/out/a.mp4")
        );

        // Replaying the same tail must not signal success again.
        let outcome = state.observe_poll(Some(&running_instance(1)), &done_tail);
        assert!(!outcome.completed_now);
    }

    #[test]
    fn backoff_ladder_doubles_and_caps_at_sixty_seconds() {
        let base = Duration::from_secs(5);
        let mut state = WatcherState::new(1, base, "videos");

        let delays: Vec<u64> = (0..4)
            .map(|_| state.observe_error(&MarketError::RateLimited).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);
        assert_eq!(state.phase(), WatchPhase::BackingOff);

        // Two more errors hit the cap.
        assert_eq!(state.observe_error(&MarketError::RateLimited).as_secs(), 60);
        assert_eq!(state.observe_error(&MarketError::RateLimited).as_secs(), 60);

        // A success resets the ladder; the next error starts over at base.
        state.observe_poll(Some(&running_instance(1)), "line");
        assert_eq!(state.phase(), WatchPhase::Streaming);
        assert_eq!(state.observe_error(&MarketError::RateLimited).as_secs(), 5);
    }

    #[test]
    fn instance_not_found_is_benign_and_does_not_climb_the_ladder() {
        let mut state = WatcherState::new(9, Duration::from_secs(5), "videos");
        let delay = state.observe_error(&MarketError::InstanceNotFound(9));
        assert_eq!(delay.as_secs(), 5);
        // The next real error starts the ladder at its first rung.
        assert_eq!(state.observe_error(&MarketError::RateLimited).as_secs(), 5);
    }

    #[test]
    fn tail_diffing_prints_only_new_lines() {
        let shown: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        // Window slid by two: overlap is ["b", "c"].
        let current: Vec<String> = ["b", "c", "d", "e"].iter().map(|s| s.to_string()).collect();
        assert_eq!(diff_new_lines(&shown, &current), vec!["d", "e"]);

        // Identical window: nothing new.
        assert!(diff_new_lines(&shown, &shown).is_empty());

        // Disjoint window (log outran the tail): everything is new.
        let jumped: Vec<String> = ["x", "y"].iter().map(|s| s.to_string()).collect();
        assert_eq!(diff_new_lines(&shown, &jumped), vec!["x", "y"]);
    }

    #[test]
    fn status_transition_to_terminal_logs_once_and_keeps_polling() {
        let mut state = WatcherState::new(3, Duration::from_secs(5), "videos");
        let running = running_instance(3);
        let outcome = state.observe_poll(Some(&running), "up");
        assert!(outcome.status_change.is_some());

        let stopped = Instance {
            status: InstanceStatus::Stopped,
            ..running.clone()
        };
        let outcome = state.observe_poll(Some(&stopped), "up");
        let message = outcome.status_change.expect("status change reported");
        assert!(message.contains("stopped"));

        // Same status again: silent.
        let outcome = state.observe_poll(Some(&stopped), "up");
        assert!(outcome.status_change.is_none());
        assert_eq!(state.phase(), WatchPhase::Streaming);
    }

    #[test]
    fn result_url_requires_the_bucket_filter() {
        let lines: Vec<String> = vec![
            "fetching https://pypi.org/simple/torch/".to_string(),
            "uploaded to https://storage.example.com/videos/out/clip.mp4".to_string(),
        ];
        assert_eq!(
            scan_result_url(&lines, "videos").as_deref(),
            Some("https://storage.example.com/videos/out/clip.mp4")
        );
        assert!(scan_result_url(&lines, "other-bucket").is_none());
    }

    /// Scripted market for loop-level tests: serves 429 for the first N
    /// polls, then a healthy instance with a completed log.
    struct ScriptedMarket {
        rate_limited_polls: u32,
        polls: AtomicU32,
        stops: AtomicU32,
        tail: String,
        observed_delays: Mutex<Vec<Duration>>,
    }

    impl MarketApi for ScriptedMarket {
        fn search_offers(&self, _: &OfferFilter) -> Result<Vec<crate::vastup_core::domain::Offer>, MarketError> {
            unimplemented!("not used by the watcher")
        }

        fn create_instance(&self, _: &CreateInstanceRequest) -> Result<u64, MarketError> {
            unimplemented!("not used by the watcher")
        }

        fn get_instance(&self, instance_id: u64) -> Result<Option<Instance>, MarketError> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst);
            if poll < self.rate_limited_polls {
                return Err(MarketError::RateLimited);
            }
            Ok(Some(running_instance(instance_id)))
        }

        fn get_logs(&self, _: u64, _: u32) -> Result<String, MarketError> {
            Ok(self.tail.clone())
        }

        fn stop_instance(&self, _: u64) -> Result<(), MarketError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn destroy_instance(&self, _: u64) -> Result<(), MarketError> {
            Ok(())
        }
    }

    #[test]
    fn rate_limit_recovery_completes_and_stops_instance_once() {
        let market = ScriptedMarket {
            rate_limited_polls: 4,
            polls: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            tail: format!(
                "starting\nhttps://storage.example.com/videos/out/a.mp4\n{COMPLETION_MARKER}"
            ),
            observed_delays: Mutex::new(Vec::new()),
        };

        // Drive the state machine directly to keep the test clock-free.
        let mut state = WatcherState::new(5, Duration::from_secs(5), "videos");
        let mut stop_requests = 0u32;
        for _ in 0..8 {
            match market
                .get_instance(5)
                .and_then(|i| market.get_logs(5, 100).map(|t| (i, t)))
            {
                Ok((instance, tail)) => {
                    let outcome = state.observe_poll(instance.as_ref(), &tail);
                    if outcome.completed_now {
                        market.stop_instance(5).unwrap();
                        stop_requests += 1;
                    }
                }
                Err(err) => {
                    market
                        .observed_delays
                        .lock()
                        .unwrap()
                        .push(state.observe_error(&err));
                }
            }
        }

        let delays: Vec<u64> = market
            .observed_delays
            .lock()
            .unwrap()
            .iter()
            .map(Duration::as_secs)
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);
        // Baseline is taken on the first *successful* fetch, which already
        // contains the marker, so it does not count as fresh: the watcher
        // must still be waiting.
        assert!(!state.is_completed());
        assert_eq!(stop_requests, 0);
        assert_eq!(market.stops.load(Ordering::SeqCst), 0);

        // A genuinely fresh marker after baseline completes exactly once.
        let fresh = format!(
            "starting\nhttps://storage.example.com/videos/out/a.mp4\n{COMPLETION_MARKER}\n\
             second run\nhttps://storage.example.com/videos/out/a.mp4\n{COMPLETION_MARKER}"
        );
        let outcome = state.observe_poll(Some(&running_instance(5)), &fresh);
        assert!(outcome.completed_now);
        assert_eq!(
            state.result_url(),
            Some("https://storage.example.com/videos/out/a.mp4")
        );
    }
}
