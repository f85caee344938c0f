use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    clock::SharedClock,
    connection::{ClientEvent, ConnectionHandle},
    db::{LocalStore, WINDOWS_KEY},
    error::{PresenceError, PresenceResult, Rejection},
    models::{Role, WindowView},
    punch::{Direction, PunchBook},
};

use super::state::{AttendanceWindow, WindowMap};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Owns the open attendance windows and closes them on time, whether or not
/// the server ever says so.
///
/// When the local timer and a server stop disagree, whichever fires first
/// closes the window; both paths end in the same state.
#[derive(Clone)]
pub struct WindowTracker {
    windows: Arc<Mutex<WindowMap>>,
    store: LocalStore,
    book: PunchBook,
    connection: ConnectionHandle,
    clock: SharedClock,
}

impl WindowTracker {
    pub fn new(
        store: LocalStore,
        book: PunchBook,
        connection: ConnectionHandle,
        clock: SharedClock,
    ) -> Self {
        Self {
            windows: Arc::new(Mutex::new(WindowMap::new())),
            store,
            book,
            connection,
            clock,
        }
    }

    /// Reloads persisted windows as-is. Anything already past its end is
    /// dropped by the next tick, not here, so restore and expiry share one path.
    pub async fn restore(&self) {
        let saved: WindowMap = self.store.load(WINDOWS_KEY, WindowMap::new()).await;
        let mut guard = self.windows.lock().await;
        *guard = saved;
        log_info!("Restored {} attendance windows", guard.len());
    }

    pub async fn is_open(&self, classroom_id: &str) -> bool {
        let now_ms = self.clock.now_ms();
        self.windows.lock().await.is_open(classroom_id, now_ms)
    }

    pub async fn any_open(&self) -> bool {
        let now_ms = self.clock.now_ms();
        self.windows
            .lock()
            .await
            .windows()
            .iter()
            .any(|window| !window.is_expired(now_ms))
    }

    pub async fn window(&self, classroom_id: &str) -> Option<AttendanceWindow> {
        self.windows.lock().await.get(classroom_id)
    }

    pub async fn remaining_ms(&self, classroom_id: &str) -> Option<i64> {
        let now_ms = self.clock.now_ms();
        self.windows
            .lock()
            .await
            .get(classroom_id)
            .map(|window| window.remaining_ms(now_ms))
    }

    pub async fn views(&self) -> Vec<WindowView> {
        let now_ms = self.clock.now_ms();
        self.windows
            .lock()
            .await
            .windows()
            .into_iter()
            .filter(|window| !window.is_expired(now_ms))
            .map(|window| WindowView {
                remaining_ms: window.remaining_ms(now_ms),
                ends_at: chrono::DateTime::from_timestamp_millis(window.end_timestamp)
                    .unwrap_or_else(|| self.clock.now()),
                classroom_id: window.classroom_id,
            })
            .collect()
    }

    /// Teacher action. The window opens optimistically once the request is
    /// handed to the channel; the server's `session_started` re-times it.
    pub async fn start_attendance(
        &self,
        actor: Role,
        classroom_id: &str,
        duration_minutes: u32,
    ) -> PresenceResult<AttendanceWindow> {
        if !actor.is_supervisor() {
            return Err(PresenceError::from(Rejection::NotSupervisor));
        }
        if duration_minutes == 0 {
            return Err(PresenceError::from(Rejection::InvalidDuration));
        }

        self.connection.emit(ClientEvent::StartAttendance {
            classroom_id: classroom_id.to_string(),
            timeout_minutes: duration_minutes,
        })?;

        Ok(self.open_window(classroom_id, duration_minutes).await)
    }

    /// Teacher action closing a window before its end.
    pub async fn stop_attendance(&self, actor: Role, classroom_id: &str) -> PresenceResult<()> {
        if !actor.is_supervisor() {
            return Err(PresenceError::from(Rejection::NotSupervisor));
        }
        if !self.is_open(classroom_id).await {
            return Err(PresenceError::from(Rejection::NoOpenWindow));
        }

        self.connection.emit(ClientEvent::StopAttendance {
            classroom_id: classroom_id.to_string(),
        })?;

        self.close_window(classroom_id).await;
        Ok(())
    }

    pub async fn on_session_started(
        &self,
        classroom_id: &str,
        duration_minutes: u32,
    ) -> AttendanceWindow {
        self.open_window(classroom_id, duration_minutes).await
    }

    pub async fn on_session_stopped(&self, classroom_id: &str) -> bool {
        self.close_window(classroom_id).await
    }

    /// Applies a server punch confirmation while the classroom's window is
    /// open. Statuses live only as long as their window, so a confirmation
    /// arriving after the close is dropped. Returns whether it was applied.
    pub async fn apply_confirmation(&self, direction: Direction, classroom_id: &str) -> bool {
        let now_ms = self.clock.now_ms();
        let guard = self.windows.lock().await;
        if !guard.is_open(classroom_id, now_ms) {
            log_info!(
                "Dropping punch-{} confirmation for {classroom_id}: no open window",
                direction.as_str()
            );
            return false;
        }
        self.book.confirm(direction, classroom_id).await
    }

    /// One pass of the expiry timer: closes every window whose end has been
    /// reached, wipes its punch status and tells the server. Returns the
    /// classrooms that closed.
    pub async fn tick(&self) -> Vec<String> {
        let now_ms = self.clock.now_ms();
        let mut guard = self.windows.lock().await;
        let expired = guard.take_expired(now_ms);
        if expired.is_empty() {
            return expired;
        }

        for classroom_id in &expired {
            self.book.clear(classroom_id).await;
            log_info!("Attendance window for {classroom_id} expired");

            let notice = ClientEvent::StopAttendance {
                classroom_id: classroom_id.clone(),
            };
            if let Err(err) = self.connection.emit(notice) {
                log_debug!("Expiry notice for {classroom_id} not sent: {err}");
            }
        }

        self.store.save(WINDOWS_KEY, &*guard).await;
        expired
    }

    async fn open_window(&self, classroom_id: &str, duration_minutes: u32) -> AttendanceWindow {
        let now_ms = self.clock.now_ms();
        let end_timestamp = WindowMap::end_for(duration_minutes, now_ms);

        let mut guard = self.windows.lock().await;
        let fresh = guard.open(classroom_id, end_timestamp, now_ms);
        if fresh {
            self.book.clear(classroom_id).await;
            log_info!("Attendance opened for {classroom_id} ({duration_minutes} min)");
        } else {
            log_debug!("Attendance window for {classroom_id} re-timed");
        }
        self.store.save(WINDOWS_KEY, &*guard).await;

        AttendanceWindow {
            classroom_id: classroom_id.to_string(),
            end_timestamp,
        }
    }

    async fn close_window(&self, classroom_id: &str) -> bool {
        let mut guard = self.windows.lock().await;
        let closed = guard.close(classroom_id);
        self.book.clear(classroom_id).await;
        if closed {
            log_info!("Attendance closed for {classroom_id}");
            self.store.save(WINDOWS_KEY, &*guard).await;
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        connection::LoopbackPeer,
        punch::{Direction, PunchState},
    };

    const START_MS: i64 = 1_700_000_000_000;

    struct Fixture {
        tracker: WindowTracker,
        book: PunchBook,
        store: LocalStore,
        peer: LoopbackPeer,
        clock: ManualClock,
    }

    fn fixture_with_store(store: LocalStore) -> Fixture {
        let clock = ManualClock::new(START_MS);
        let (connection, peer) = ConnectionHandle::loopback();
        let book = PunchBook::new(store.clone());
        let tracker = WindowTracker::new(
            store.clone(),
            book.clone(),
            connection,
            Arc::new(clock.clone()),
        );
        Fixture {
            tracker,
            book,
            store,
            peer,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(LocalStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn teacher_start_opens_window_and_notifies_server() {
        let mut fx = fixture();
        let window = fx
            .tracker
            .start_attendance(Role::Teacher, "C1", 5)
            .await
            .unwrap();

        assert_eq!(window.end_timestamp, START_MS + 300_000);
        assert!(fx.tracker.is_open("C1").await);
        assert_eq!(
            fx.peer.sent(),
            vec![ClientEvent::StartAttendance {
                classroom_id: "C1".into(),
                timeout_minutes: 5
            }]
        );
    }

    #[tokio::test]
    async fn students_cannot_start_attendance() {
        let mut fx = fixture();
        let err = fx
            .tracker
            .start_attendance(Role::Student, "C1", 5)
            .await
            .unwrap_err();
        assert_eq!(err, PresenceError::from(Rejection::NotSupervisor));
        assert!(fx.peer.sent().is_empty());
        assert!(!fx.tracker.is_open("C1").await);
    }

    #[tokio::test]
    async fn zero_minute_window_is_refused() {
        let fx = fixture();
        let err = fx
            .tracker
            .start_attendance(Role::Teacher, "C1", 0)
            .await
            .unwrap_err();
        assert_eq!(err, PresenceError::from(Rejection::InvalidDuration));
    }

    #[tokio::test]
    async fn tick_expires_window_and_resets_status() {
        let mut fx = fixture();
        fx.tracker.on_session_started("C1", 5).await;
        fx.book.confirm(Direction::In, "C1").await;

        fx.clock.advance_ms(299_999);
        assert!(fx.tracker.tick().await.is_empty());
        assert!(fx.tracker.any_open().await);

        fx.clock.advance_ms(1);
        assert_eq!(fx.tracker.tick().await, vec!["C1".to_string()]);
        assert!(!fx.tracker.is_open("C1").await);
        assert!(!fx.tracker.any_open().await);
        assert_eq!(fx.book.status("C1").await, PunchState::None);
        assert_eq!(
            fx.peer.sent(),
            vec![ClientEvent::StopAttendance {
                classroom_id: "C1".into()
            }]
        );
    }

    #[tokio::test]
    async fn expiry_survives_a_dead_connection() {
        let fx = fixture();
        fx.tracker.on_session_started("C1", 1).await;
        fx.peer.set_connected(false);

        fx.clock.advance_ms(60_000);
        assert_eq!(fx.tracker.tick().await, vec!["C1".to_string()]);
    }

    #[tokio::test]
    async fn server_stop_closes_immediately() {
        let fx = fixture();
        fx.tracker.on_session_started("C1", 5).await;
        fx.book.confirm(Direction::In, "C1").await;

        assert!(fx.tracker.on_session_stopped("C1").await);
        assert!(!fx.tracker.is_open("C1").await);
        assert_eq!(fx.book.status("C1").await, PunchState::None);

        // A late local expiry for the same window is a no-op.
        fx.clock.advance_ms(300_000);
        assert!(fx.tracker.tick().await.is_empty());
        assert!(!fx.tracker.on_session_stopped("C1").await);
    }

    #[tokio::test]
    async fn restart_during_open_window_keeps_statuses() {
        let fx = fixture();
        fx.tracker.on_session_started("C1", 5).await;
        fx.book.confirm(Direction::In, "C1").await;

        // Duplicate start for a live window only re-times it.
        fx.clock.advance_ms(60_000);
        let window = fx.tracker.on_session_started("C1", 5).await;
        assert_eq!(window.end_timestamp, START_MS + 60_000 + 300_000);
        assert_eq!(fx.book.status("C1").await, PunchState::In);
    }

    #[tokio::test]
    async fn new_window_resets_previous_status() {
        let fx = fixture();
        fx.tracker.on_session_started("C1", 1).await;
        fx.book.confirm(Direction::Out, "C1").await;

        fx.clock.advance_ms(60_000);
        fx.tracker.on_session_started("C1", 1).await;
        assert_eq!(fx.book.status("C1").await, PunchState::None);
    }

    #[tokio::test]
    async fn reloaded_window_past_its_end_is_expired_on_first_tick() {
        let store = LocalStore::in_memory().unwrap();
        {
            let fx = fixture_with_store(store.clone());
            fx.tracker.on_session_started("C1", 5).await;
            fx.tracker.on_session_started("C2", 30).await;
        }

        let fx = fixture_with_store(store);
        fx.clock.advance_ms(10 * 60_000);
        fx.tracker.restore().await;
        fx.book.restore().await;

        assert!(!fx.tracker.is_open("C1").await);
        assert!(fx.tracker.is_open("C2").await);
        assert_eq!(fx.tracker.tick().await, vec!["C1".to_string()]);
        assert!(fx.tracker.window("C1").await.is_none());

        let saved: WindowMap = fx.store.load(WINDOWS_KEY, WindowMap::new()).await;
        assert!(saved.get("C1").is_none());
        assert!(saved.get("C2").is_some());
    }

    #[tokio::test]
    async fn confirmation_after_close_leaves_no_status() {
        let fx = fixture();
        fx.tracker.on_session_started("C1", 5).await;
        assert!(fx.tracker.apply_confirmation(Direction::In, "C1").await);
        assert_eq!(fx.book.status("C1").await, PunchState::In);

        fx.tracker.on_session_stopped("C1").await;
        assert!(!fx.tracker.apply_confirmation(Direction::Out, "C1").await);
        assert!(!fx.tracker.apply_confirmation(Direction::In, "C9").await);
        assert!(fx.book.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn open_windows_are_never_past_their_end_after_a_tick() {
        let fx = fixture();
        for (index, minutes) in [1_u32, 2, 3, 5, 8].into_iter().enumerate() {
            fx.tracker
                .on_session_started(&format!("C{index}"), minutes)
                .await;
        }

        for _ in 0..12 {
            fx.clock.advance_ms(45_000);
            fx.tracker.tick().await;
            let now_ms = fx.clock.now_ms();
            for window in fx.tracker.windows.lock().await.windows() {
                assert!(window.end_timestamp > now_ms);
            }
        }
        assert!(!fx.tracker.any_open().await);
    }

    #[tokio::test]
    async fn teacher_can_stop_early() {
        let mut fx = fixture();
        fx.tracker
            .start_attendance(Role::Teacher, "C1", 5)
            .await
            .unwrap();
        fx.peer.sent();

        fx.tracker.stop_attendance(Role::Teacher, "C1").await.unwrap();
        assert!(!fx.tracker.is_open("C1").await);
        assert_eq!(
            fx.peer.sent(),
            vec![ClientEvent::StopAttendance {
                classroom_id: "C1".into()
            }]
        );

        let err = fx
            .tracker
            .stop_attendance(Role::Teacher, "C1")
            .await
            .unwrap_err();
        assert_eq!(err, PresenceError::from(Rejection::NoOpenWindow));
    }
}
