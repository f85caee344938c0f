use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    attendance::{AttendanceWindow, WindowTracker},
    connection::{ClientEvent, ConnectionHandle, LinkStatus, ServerEvent},
    error::{PresenceError, PresenceResult, Rejection},
    models::{PresenceSnapshot, Role},
    punch::{Direction, PunchCoordinator, PunchReceipt},
};

const ENABLE_LOGS: bool = true;
const NOTICE_CAPACITY: usize = 64;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Info,
    Error,
}

/// User-facing message produced by the background worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub classroom_id: Option<String>,
    pub message: String,
}

impl Notice {
    fn info(classroom_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            classroom_id: classroom_id.map(str::to_string),
            message: message.into(),
        }
    }

    fn error(classroom_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            classroom_id: classroom_id.map(str::to_string),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub role: Role,
    pub tick_interval: Duration,
    pub default_duration_minutes: u32,
}

/// Front door for the presentation layer. Owns the one background task that
/// runs the expiry tick, sweeps stale punch locks and applies server events.
#[derive(Clone)]
pub struct PresenceController {
    connection: ConnectionHandle,
    tracker: WindowTracker,
    coordinator: PunchCoordinator,
    options: ControllerOptions,
    notices: broadcast::Sender<Notice>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown: CancellationToken,
}

impl PresenceController {
    pub fn new(
        connection: ConnectionHandle,
        tracker: WindowTracker,
        coordinator: PunchCoordinator,
        options: ControllerOptions,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            connection,
            tracker,
            coordinator,
            options,
            notices,
            worker: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.options.role
    }

    /// Reloads persisted windows and punch statuses.
    pub async fn restore(&self) {
        self.coordinator.book().restore().await;
        self.tracker.restore().await;
    }

    /// Spawns the background worker. Later calls are no-ops.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            log_debug!("Presence worker already running");
            return;
        }

        // Subscribe before spawning so nothing published in between is lost.
        let mut events = self.connection.subscribe();
        let mut link = self.connection.watch_status();
        let controller = self.clone();
        let cancel = self.shutdown.clone();
        let tick_interval = self.options.tick_interval;

        *worker = Some(tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log_info!("Presence worker stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        controller.on_tick().await;
                    }
                    event = events.recv() => match event {
                        Some(event) => controller.dispatch(event).await,
                        None => {
                            log_warn!("Event bus closed; presence worker exiting");
                            break;
                        }
                    },
                    Ok(()) = link.changed() => {
                        let status = *link.borrow_and_update();
                        controller.on_link_status(status);
                    }
                }
            }
        }));
        log_info!("Presence worker started");
    }

    /// Stops the background worker and waits for it to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log_error!("Presence worker ended abnormally: {err}");
            }
        }
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub async fn start_attendance(
        &self,
        classroom_id: &str,
        duration_minutes: Option<u32>,
    ) -> PresenceResult<AttendanceWindow> {
        let minutes = duration_minutes.unwrap_or(self.options.default_duration_minutes);
        self.tracker
            .start_attendance(self.options.role, classroom_id, minutes)
            .await
    }

    pub async fn stop_attendance(&self, classroom_id: &str) -> PresenceResult<()> {
        self.tracker
            .stop_attendance(self.options.role, classroom_id)
            .await
    }

    pub async fn punch_in(&self, classroom_id: &str) -> PresenceResult<PunchReceipt> {
        self.coordinator.punch_in(classroom_id).await
    }

    pub async fn punch_out(&self, classroom_id: &str) -> PresenceResult<PunchReceipt> {
        self.coordinator.punch_out(classroom_id).await
    }

    pub fn join(&self, classroom_ids: &[String]) -> PresenceResult<()> {
        self.connection.join_classrooms(classroom_ids)
    }

    pub fn send_message(&self, classroom_id: &str, message: &str) -> PresenceResult<()> {
        let message = message.trim();
        if message.is_empty() {
            return Err(PresenceError::from(Rejection::EmptyMessage));
        }
        self.connection.emit(ClientEvent::NewMessage {
            classroom_id: classroom_id.to_string(),
            message: message.to_string(),
        })
    }

    pub async fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            windows: self.tracker.views().await,
            statuses: self.coordinator.book().statuses().await,
        }
    }

    pub async fn any_window_open(&self) -> bool {
        self.tracker.any_open().await
    }

    pub async fn remaining_ms(&self, classroom_id: &str) -> Option<i64> {
        self.tracker.remaining_ms(classroom_id).await
    }

    pub fn link_status(&self) -> LinkStatus {
        self.connection.status()
    }

    pub(crate) async fn on_tick(&self) {
        for classroom_id in self.tracker.tick().await {
            self.notify(Notice::info(Some(&classroom_id), "Attendance window closed"));
        }
        for (direction, classroom_id) in self.coordinator.sweep_stale_locks().await {
            self.notify(Notice::error(
                Some(&classroom_id),
                format!("Punch-{} was not confirmed in time", direction.as_str()),
            ));
        }
    }

    pub(crate) async fn dispatch(&self, event: ServerEvent) {
        log_debug!("Dispatching server event {:?}", event.kind());
        match event {
            ServerEvent::Connected => {
                log_info!("Server acknowledged the connection");
            }
            ServerEvent::SessionStarted {
                classroom_id,
                duration_minutes,
            } => {
                self.tracker
                    .on_session_started(&classroom_id, duration_minutes)
                    .await;
                self.notify(Notice::info(
                    Some(&classroom_id),
                    format!("Attendance open for {duration_minutes} min"),
                ));
            }
            ServerEvent::SessionStopped { classroom_id } => {
                if self.tracker.on_session_stopped(&classroom_id).await {
                    self.notify(Notice::info(Some(&classroom_id), "Attendance window closed"));
                }
            }
            ServerEvent::PunchIn { classroom_id, .. } => {
                self.on_punch_confirmed(Direction::In, &classroom_id).await;
            }
            ServerEvent::PunchOut { classroom_id, .. } => {
                self.on_punch_confirmed(Direction::Out, &classroom_id).await;
            }
            ServerEvent::NewMessage(payload) => {
                let classroom_id = payload
                    .get("classroomId")
                    .and_then(|value| value.as_str())
                    .map(str::to_string);
                let message = payload
                    .get("message")
                    .and_then(|value| value.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| payload.to_string());
                self.notify(Notice::info(classroom_id.as_deref(), message));
            }
            ServerEvent::Success { message } => {
                self.notify(Notice::info(None, message));
            }
            ServerEvent::Error { message } => {
                log_error!("Server reported an error: {message}");
                let rolled_back = self.coordinator.on_server_error(&message).await;
                if rolled_back.is_empty() {
                    self.notify(Notice::error(None, message));
                } else {
                    for classroom_id in &rolled_back {
                        self.notify(Notice::error(Some(classroom_id), message.clone()));
                    }
                }
            }
        }
    }

    async fn on_punch_confirmed(&self, direction: Direction, classroom_id: &str) {
        let status = self.coordinator.on_confirmed(direction, classroom_id).await;
        self.notify(Notice::info(
            Some(classroom_id),
            format!("Punch-{} confirmed ({})", direction.as_str(), status.as_str()),
        ));
    }

    fn on_link_status(&self, status: LinkStatus) {
        match status {
            LinkStatus::Connected => log_info!("Duplex channel connected"),
            LinkStatus::Connecting => log_debug!("Duplex channel connecting"),
            LinkStatus::Disconnected => {
                log_warn!("Duplex channel disconnected");
                self.notify(Notice::error(None, "Connection lost; retrying"));
            }
        }
    }

    fn notify(&self, notice: Notice) {
        // No receivers is fine; notices are advisory.
        let _ = self.notices.send(notice);
    }
}

/// Controller over an in-memory store and a loopback channel, ticking every
/// 10 ms against a manual clock.
#[cfg(test)]
pub(crate) fn loopback_controller(
    role: Role,
) -> (
    PresenceController,
    crate::connection::LoopbackPeer,
    crate::clock::ManualClock,
) {
    use crate::{
        clock::{ManualClock, SharedClock},
        connection::Location,
        db::LocalStore,
        punch::{PunchBook, ScriptedLocation},
    };

    let store = LocalStore::in_memory().expect("in-memory store");
    let clock = ManualClock::new(1_700_000_000_000);
    let shared: SharedClock = Arc::new(clock.clone());
    let (connection, peer) = ConnectionHandle::loopback();
    let book = PunchBook::new(store.clone());
    let tracker = WindowTracker::new(store, book.clone(), connection.clone(), shared.clone());
    let coordinator = PunchCoordinator::new(
        book,
        tracker.clone(),
        connection.clone(),
        Arc::new(ScriptedLocation::always(Ok(Location {
            lat: 12.97,
            long: 77.59,
        }))),
        shared,
        role,
        Duration::from_secs(30),
    );
    let controller = PresenceController::new(
        connection,
        tracker,
        coordinator,
        ControllerOptions {
            role,
            tick_interval: Duration::from_millis(10),
            default_duration_minutes: 5,
        },
    );
    (controller, peer, clock)
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        connection::LoopbackPeer,
        punch::PunchState,
    };

    struct Fixture {
        controller: PresenceController,
        peer: LoopbackPeer,
        clock: ManualClock,
    }

    fn fixture(role: Role) -> Fixture {
        let (controller, peer, clock) = loopback_controller(role);
        Fixture {
            controller,
            peer,
            clock,
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..400 {
            if check().await {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn worker_applies_server_events_and_expires_windows() {
        let mut fx = fixture(Role::Student);
        fx.controller.start().await;

        fx.peer.push(ServerEvent::SessionStarted {
            classroom_id: "C1".into(),
            duration_minutes: 5,
        });
        let controller = fx.controller.clone();
        eventually(|| {
            let controller = controller.clone();
            async move { controller.any_window_open().await }
        })
        .await;

        // The expiry notice only goes out once the worker has ticked.
        fx.clock.advance_ms(5 * 60_000);
        let stop = ClientEvent::StopAttendance {
            classroom_id: "C1".into(),
        };
        let mut sent = Vec::new();
        for _ in 0..400 {
            sent.extend(fx.peer.sent());
            if sent.contains(&stop) {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert!(sent.contains(&stop));
        assert!(fx.controller.tracker.window("C1").await.is_none());
        fx.controller.shutdown().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let fx = fixture(Role::Student);
        fx.controller.start().await;
        fx.controller.start().await;
        assert!(fx.controller.worker.lock().await.is_some());
        fx.controller.shutdown().await;
        assert!(fx.controller.worker.lock().await.is_none());
    }

    #[tokio::test]
    async fn confirmations_drive_the_snapshot() {
        let fx = fixture(Role::Student);
        fx.controller
            .dispatch(ServerEvent::SessionStarted {
                classroom_id: "C1".into(),
                duration_minutes: 5,
            })
            .await;

        fx.controller.punch_in("C1").await.unwrap();
        fx.controller
            .dispatch(ServerEvent::PunchIn {
                classroom_id: "C1".into(),
                request_id: None,
            })
            .await;

        let snapshot = fx.controller.snapshot().await;
        assert!(snapshot.any_window_open());
        assert_eq!(snapshot.status_of("C1"), PunchState::In);
        assert_eq!(snapshot.windows[0].remaining_ms, 5 * 60_000);
    }

    #[tokio::test]
    async fn server_error_rolls_back_and_notifies() {
        let fx = fixture(Role::Student);
        let mut notices = fx.controller.subscribe_notices();
        fx.controller
            .dispatch(ServerEvent::SessionStarted {
                classroom_id: "C1".into(),
                duration_minutes: 5,
            })
            .await;
        fx.controller.punch_in("C1").await.unwrap();

        fx.controller
            .dispatch(ServerEvent::Error {
                message: "outside geofence".into(),
            })
            .await;

        assert_eq!(fx.controller.snapshot().await.status_of("C1"), PunchState::None);

        let mut saw_error = false;
        while let Ok(notice) = notices.try_recv() {
            if notice.level == NoticeLevel::Error {
                assert_eq!(notice.classroom_id.as_deref(), Some("C1"));
                assert_eq!(notice.message, "outside geofence");
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn server_error_without_pending_punch_is_a_general_notice() {
        let fx = fixture(Role::Student);
        let mut notices = fx.controller.subscribe_notices();

        fx.controller
            .dispatch(ServerEvent::Error {
                message: "classroom not found".into(),
            })
            .await;

        assert_eq!(
            notices.try_recv().unwrap(),
            Notice {
                level: NoticeLevel::Error,
                classroom_id: None,
                message: "classroom not found".into(),
            }
        );
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn teacher_uses_default_duration() {
        let mut fx = fixture(Role::Teacher);
        let window = fx.controller.start_attendance("C1", None).await.unwrap();
        assert_eq!(window.end_timestamp, fx.clock.now_ms() + 5 * 60_000);
        assert_eq!(
            fx.peer.sent(),
            vec![ClientEvent::StartAttendance {
                classroom_id: "C1".into(),
                timeout_minutes: 5,
            }]
        );

        fx.controller.stop_attendance("C1").await.unwrap();
        assert!(!fx.controller.any_window_open().await);
    }

    #[tokio::test]
    async fn messages_are_trimmed_and_empty_ones_refused() {
        let mut fx = fixture(Role::Student);
        assert_eq!(
            fx.controller.send_message("C1", "   "),
            Err(PresenceError::from(Rejection::EmptyMessage))
        );

        fx.controller.send_message("C1", " hello ").unwrap();
        assert_eq!(
            fx.peer.sent(),
            vec![ClientEvent::NewMessage {
                classroom_id: "C1".into(),
                message: "hello".into(),
            }]
        );
    }

    #[tokio::test]
    async fn chat_messages_become_notices() {
        let fx = fixture(Role::Student);
        let mut notices = fx.controller.subscribe_notices();

        fx.controller
            .dispatch(ServerEvent::NewMessage(serde_json::json!({
                "classroomId": "C2",
                "message": "quiz at noon"
            })))
            .await;

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.classroom_id.as_deref(), Some("C2"));
        assert_eq!(notice.message, "quiz at noon");
    }
}
