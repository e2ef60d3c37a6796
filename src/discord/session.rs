use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serenity::{
    client::bridge::gateway::ShardManager,
    framework::standard::StandardFramework,
    gateway::ConnectionStage,
    model::id::GuildId,
    prelude::*,
};
use tokio::time::{interval, sleep, Instant};

use crate::{
    components::{linker::ReplyLinks, xkcd::XkcdCache},
    config::BotConfig,
    discord::{
        commands::{after_hook, before_hook, normal_message_hook, GENERAL_GROUP},
        handler::Handler,
        intents,
        rest::SerenityRoleClient,
        roles::RoleEngine,
        rules::RoleRules,
    },
    error::{is_fatal_session_error, BotError},
    helpers::*,
};

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
pub const STALE_AFTER: Duration = Duration::from_secs(180);

/// Exponential reconnect delay. Starts at `base`, doubles on every call to
/// `next_delay` and never exceeds `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

/// Shared view of the gateway session, updated by the event handler and the
/// watchdog and read by `!status`.
pub struct SessionStatus {
    started: DateTime<Utc>,
    last_ready: RwLock<Option<DateTime<Utc>>>,
    last_resume: RwLock<Option<DateTime<Utc>>>,
    working_guild: RwLock<Option<GuildId>>,
    reconnects: AtomicU32,
    shards_connected: AtomicUsize,
    // u64::MAX until the first heartbeat is acknowledged
    latency_ms: AtomicU64,
    ready_since_attempt: AtomicBool,
    shutdown_requested: AtomicBool,
    restart_requested: AtomicBool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub uptime: chrono::Duration,
    pub last_ready: Option<DateTime<Utc>>,
    pub last_resume: Option<DateTime<Utc>>,
    pub working_guild: Option<GuildId>,
    pub reconnects: u32,
    pub shards_connected: usize,
    pub latency: Option<Duration>,
}

impl SessionStatus {
    pub fn new() -> Self {
        SessionStatus {
            started: Utc::now(),
            last_ready: RwLock::new(None),
            last_resume: RwLock::new(None),
            working_guild: RwLock::new(None),
            reconnects: AtomicU32::new(0),
            shards_connected: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(u64::MAX),
            ready_since_attempt: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
        }
    }

    pub fn record_ready(&self, guild: Option<GuildId>) {
        *self.last_ready.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        *self.working_guild.write().unwrap_or_else(|e| e.into_inner()) = guild;
        self.ready_since_attempt.store(true, Ordering::SeqCst);
    }

    pub fn record_resume(&self) {
        *self.last_resume.write().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        self.ready_since_attempt.store(true, Ordering::SeqCst);
    }

    pub fn record_shards(&self, connected: usize, latency: Option<Duration>) {
        self.shards_connected.store(connected, Ordering::SeqCst);
        let ms = latency.map_or(u64::MAX, |l| l.as_millis() as u64);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.shards_connected.store(0, Ordering::SeqCst);
    }

    /// Whether the session reached READY (or resumed) since the last call.
    fn take_ready(&self) -> bool {
        self.ready_since_attempt.swap(false, Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::SeqCst);
    }

    fn take_restart(&self) -> bool {
        self.restart_requested.swap(false, Ordering::SeqCst)
    }

    pub fn working_guild(&self) -> Option<GuildId> {
        *self.working_guild.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let latency = match self.latency_ms.load(Ordering::SeqCst) {
            u64::MAX => None,
            ms => Some(Duration::from_millis(ms)),
        };
        StatusSnapshot {
            uptime: Utc::now() - self.started,
            last_ready: *self.last_ready.read().unwrap_or_else(|e| e.into_inner()),
            last_resume: *self.last_resume.read().unwrap_or_else(|e| e.into_inner()),
            working_guild: self.working_guild(),
            reconnects: self.reconnects.load(Ordering::SeqCst),
            shards_connected: self.shards_connected.load(Ordering::SeqCst),
            latency,
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Liveness {
    Healthy,
    Degraded(Duration),
    Stale(Duration),
}

/// Decides when a session with no connected shards has been down long enough
/// that serenity's own reconnect logic is clearly stuck.
#[derive(Debug)]
pub struct LivenessTracker {
    stale_after: Duration,
    last_connected: Instant,
}

impl LivenessTracker {
    pub fn new(stale_after: Duration, now: Instant) -> Self {
        LivenessTracker {
            stale_after,
            last_connected: now,
        }
    }

    pub fn observe(&mut self, connected_shards: usize, now: Instant) -> Liveness {
        if connected_shards > 0 {
            self.last_connected = now;
            return Liveness::Healthy;
        }
        let down_for = now.saturating_duration_since(self.last_connected);
        match down_for >= self.stale_after {
            true => Liveness::Stale(down_for),
            false => Liveness::Degraded(down_for),
        }
    }
}

async fn watch_liveness(shard_manager: Arc<Mutex<ShardManager>>, status: Arc<SessionStatus>) {
    let mut ticker = interval(WATCHDOG_INTERVAL);
    let mut tracker = LivenessTracker::new(STALE_AFTER, Instant::now());
    loop {
        ticker.tick().await;
        let (connected, latency) = {
            let manager = shard_manager.lock().await;
            let runners = manager.runners.lock().await;
            let connected = runners
                .values()
                .filter(|r| r.stage == ConnectionStage::Connected)
                .count();
            let latency = runners.values().filter_map(|r| r.latency).max();
            (connected, latency)
        };
        status.record_shards(connected, latency);

        match tracker.observe(connected, Instant::now()) {
            Liveness::Healthy => (),
            Liveness::Degraded(down_for) => {
                debug!("No shard connected for {}s", down_for.as_secs());
            }
            Liveness::Stale(down_for) => {
                warn!(
                    "No shard connected for {}s, restarting the gateway session",
                    down_for.as_secs()
                );
                status.request_restart();
                shard_manager.lock().await.shutdown_all().await;
                return;
            }
        }
    }
}

async fn shutdown_on_ctrl_c(shard_manager: Arc<Mutex<ShardManager>>, status: Arc<SessionStatus>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Couldn't listen for ctrl-c: {}", e);
        return;
    }
    info!("Received ctrl-c, shutting down");
    status.request_shutdown();
    shard_manager.lock().await.shutdown_all().await;
}

/// How a run of `start_autosharded` ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEnd {
    Shutdown,
    Fatal,
    WatchdogRestart,
    Dropped,
}

pub fn session_end(
    result: &Result<(), serenity::Error>,
    shutdown_requested: bool,
    restart_requested: bool,
) -> SessionEnd {
    match result {
        _ if shutdown_requested => SessionEnd::Shutdown,
        Err(e) if is_fatal_session_error(e) => SessionEnd::Fatal,
        _ if restart_requested => SessionEnd::WatchdogRestart,
        _ => SessionEnd::Dropped,
    }
}

/// A session that got as far as READY proves the setup works, so the next
/// reconnect starts over from the base delay.
pub fn reconnect_delay(backoff: &mut Backoff, reached_ready: bool) -> Duration {
    if reached_ready {
        backoff.reset();
    }
    backoff.next_delay()
}

async fn build_client(config: &BotConfig) -> Result<Client, serenity::Error> {
    let framework = StandardFramework::new()
        .configure(|c| c.prefix("!"))
        .before(before_hook)
        .after(after_hook)
        .normal_message(normal_message_hook)
        .group(&GENERAL_GROUP);

    Client::builder(&config.token, intents())
        .event_handler(Handler)
        .framework(framework)
        .await
}

/// Runs the bot until it is shut down or hits an error that reconnecting
/// cannot fix. Every attempt gets a fresh client; role rules and the
/// message-side caches carry over between attempts.
pub async fn run(config: BotConfig, rules: RoleRules) -> Result<(), BotError> {
    let config = Arc::new(config);
    let status = Arc::new(SessionStatus::new());
    let linker = Arc::new(Mutex::new(ReplyLinks::default()));
    let xkcd = Arc::new(XkcdCache::default());
    let mut rules = rules;
    let mut backoff = Backoff::default();

    loop {
        let mut client = build_client(&config).await?;
        let engine = Arc::new(RoleEngine::new(
            rules.clone(),
            Arc::new(SerenityRoleClient::new(
                client.cache_and_http.cache.clone(),
                client.cache_and_http.http.clone(),
            )),
        ));
        {
            let mut data = client.data.write().await;
            data.insert::<EngineContainer>(engine.clone());
            data.insert::<StatusContainer>(status.clone());
            data.insert::<ConfigContainer>(config.clone());
            data.insert::<LinkerContainer>(linker.clone());
            data.insert::<XkcdContainer>(xkcd.clone());
        }

        let watchdog = tokio::spawn(watch_liveness(
            client.shard_manager.clone(),
            status.clone(),
        ));
        let ctrl_c = tokio::spawn(shutdown_on_ctrl_c(
            client.shard_manager.clone(),
            status.clone(),
        ));
        let result = client.start_autosharded().await;
        watchdog.abort();
        ctrl_c.abort();
        rules = engine.rules().await.as_ref().clone();

        match session_end(&result, status.shutdown_requested(), status.take_restart()) {
            SessionEnd::Shutdown => {
                info!("Gateway session closed");
                return Ok(());
            }
            SessionEnd::Fatal => {
                let err = result.err().map_or_else(
                    || BotError::new("gateway session failed"),
                    BotError::from,
                );
                error!("Gateway session failed and can't recover: {}", err);
                return Err(err);
            }
            SessionEnd::WatchdogRestart => {
                warn!("Gateway session restarted by the liveness watchdog")
            }
            SessionEnd::Dropped => match &result {
                Err(e) => warn!("Gateway session failed: {}", e),
                Ok(()) => warn!("Gateway session ended unexpectedly"),
            },
        }

        let delay = reconnect_delay(&mut backoff, status.take_ready());
        status.record_reconnect();
        info!("Reconnecting in {}s", delay.as_secs());
        tokio::select! {
            _ = sleep(delay) => (),
            _ = tokio::signal::ctrl_c() => {
                info!("Received ctrl-c while reconnecting, shutting down");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serenity::gateway::GatewayError;

    use super::*;

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn default_backoff_tops_out_at_five_minutes() {
        let mut backoff = Backoff::default();
        let last = (0..20).map(|_| backoff.next_delay()).last().unwrap();
        assert_eq!(last, Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_goes_stale_without_connected_shards() {
        let start = Instant::now();
        let mut tracker = LivenessTracker::new(Duration::from_secs(180), start);

        assert_eq!(tracker.observe(1, start), Liveness::Healthy);
        assert_eq!(
            tracker.observe(0, start + Duration::from_secs(60)),
            Liveness::Degraded(Duration::from_secs(60))
        );
        assert_eq!(
            tracker.observe(0, start + Duration::from_secs(180)),
            Liveness::Stale(Duration::from_secs(180))
        );
        // a reconnected shard clears the clock
        let later = start + Duration::from_secs(200);
        assert_eq!(tracker.observe(2, later), Liveness::Healthy);
        assert_eq!(
            tracker.observe(0, later + Duration::from_secs(1)),
            Liveness::Degraded(Duration::from_secs(1))
        );
    }

    #[test]
    fn ready_flag_is_consumed_once() {
        let status = SessionStatus::new();
        assert!(!status.take_ready());
        status.record_ready(Some(GuildId(9)));
        assert!(status.take_ready());
        assert!(!status.take_ready());
        assert_eq!(status.working_guild(), Some(GuildId(9)));
    }

    #[test]
    fn snapshot_reports_latency_and_reconnects() {
        let status = SessionStatus::new();
        assert_eq!(status.snapshot().latency, None);

        status.record_shards(2, Some(Duration::from_millis(84)));
        status.record_reconnect();
        let snapshot = status.snapshot();
        assert_eq!(snapshot.latency, Some(Duration::from_millis(84)));
        assert_eq!(snapshot.reconnects, 1);
        // reconnecting drops the shard count until the watchdog sees them again
        assert_eq!(snapshot.shards_connected, 0);
    }

    #[test]
    fn classifies_how_sessions_end() {
        let ok: Result<(), serenity::Error> = Ok(());
        let fatal = Err(serenity::Error::Gateway(GatewayError::InvalidAuthentication));
        let dropped = Err(serenity::Error::Gateway(GatewayError::HeartbeatFailed));

        assert_eq!(session_end(&ok, true, false), SessionEnd::Shutdown);
        assert_eq!(session_end(&dropped, true, true), SessionEnd::Shutdown);
        assert_eq!(session_end(&fatal, false, false), SessionEnd::Fatal);
        assert_eq!(session_end(&fatal, false, true), SessionEnd::Fatal);
        assert_eq!(session_end(&ok, false, true), SessionEnd::WatchdogRestart);
        assert_eq!(session_end(&dropped, false, true), SessionEnd::WatchdogRestart);
        assert_eq!(session_end(&ok, false, false), SessionEnd::Dropped);
        assert_eq!(session_end(&dropped, false, false), SessionEnd::Dropped);
    }

    #[test]
    fn reaching_ready_resets_reconnect_delay() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(reconnect_delay(&mut backoff, false), Duration::from_secs(1));
        assert_eq!(reconnect_delay(&mut backoff, false), Duration::from_secs(2));
        assert_eq!(reconnect_delay(&mut backoff, false), Duration::from_secs(4));
        assert_eq!(reconnect_delay(&mut backoff, true), Duration::from_secs(1));
        assert_eq!(reconnect_delay(&mut backoff, false), Duration::from_secs(2));
    }
}
