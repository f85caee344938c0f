use std::{sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    attendance::WindowTracker,
    clock::SharedClock,
    connection::{ClientEvent, ConnectionHandle},
    error::{PresenceError, PresenceResult, Rejection},
    models::Role,
};

use super::{
    book::PunchBook,
    geolocation::GeolocationProvider,
    state::{Direction, PunchState},
};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Accepted optimistic punch; the server confirmation settles it later.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchReceipt {
    pub classroom_id: String,
    pub direction: Direction,
    pub request_id: String,
    pub status: PunchState,
}

/// Drives punch-in/punch-out for the signed-in user.
#[derive(Clone)]
pub struct PunchCoordinator {
    book: PunchBook,
    windows: WindowTracker,
    connection: ConnectionHandle,
    geolocation: Arc<dyn GeolocationProvider>,
    clock: SharedClock,
    role: Role,
    lock_ttl: Duration,
}

impl PunchCoordinator {
    pub fn new(
        book: PunchBook,
        windows: WindowTracker,
        connection: ConnectionHandle,
        geolocation: Arc<dyn GeolocationProvider>,
        clock: SharedClock,
        role: Role,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            book,
            windows,
            connection,
            geolocation,
            clock,
            role,
            lock_ttl,
        }
    }

    pub fn book(&self) -> &PunchBook {
        &self.book
    }

    pub async fn status(&self, classroom_id: &str) -> PunchState {
        self.book.status(classroom_id).await
    }

    pub async fn punch_in(&self, classroom_id: &str) -> PresenceResult<PunchReceipt> {
        self.ensure_can_punch()?;
        if !self.windows.is_open(classroom_id).await {
            return Err(PresenceError::from(Rejection::NoOpenWindow));
        }
        self.punch(Direction::In, classroom_id).await
    }

    pub async fn punch_out(&self, classroom_id: &str) -> PresenceResult<PunchReceipt> {
        self.ensure_can_punch()?;
        self.punch(Direction::Out, classroom_id).await
    }

    fn ensure_can_punch(&self) -> PresenceResult<()> {
        if self.role.is_supervisor() {
            return Err(PresenceError::from(Rejection::SupervisorCannotPunch));
        }
        Ok(())
    }

    async fn punch(&self, direction: Direction, classroom_id: &str) -> PresenceResult<PunchReceipt> {
        let now_ms = self.clock.now_ms();
        let ttl_ms = i64::try_from(self.lock_ttl.as_millis()).unwrap_or(i64::MAX);
        let pending = self
            .book
            .begin(direction, classroom_id, now_ms, ttl_ms)
            .await?;

        let location = match self.geolocation.current_position().await {
            Ok(location) => location,
            Err(err) => {
                self.book
                    .rollback(direction, classroom_id, &pending.request_id)
                    .await;
                let err = PresenceError::from(err);
                log_warn!("Punch-{} for {classroom_id} aborted: {err}", direction.as_str());
                return Err(err);
            }
        };

        // The window may have closed, or the step been rolled back, while
        // the lookup was pending.
        if direction == Direction::In && !self.windows.is_open(classroom_id).await {
            self.book
                .rollback(direction, classroom_id, &pending.request_id)
                .await;
            log_info!("Punch-in for {classroom_id} dropped: window closed during lookup");
            return Err(PresenceError::from(Rejection::NoOpenWindow));
        }
        if !self
            .book
            .is_outstanding(classroom_id, &pending.request_id)
            .await
        {
            log_info!(
                "Punch-{} for {classroom_id} dropped before sending",
                direction.as_str()
            );
            return Err(if self.windows.is_open(classroom_id).await {
                PresenceError::ServerRejected("request was rolled back before it was sent".into())
            } else {
                PresenceError::from(Rejection::NoOpenWindow)
            });
        }

        let request = match direction {
            Direction::In => ClientEvent::PunchIn {
                classroom_id: classroom_id.to_string(),
                location,
                request_id: pending.request_id.clone(),
            },
            Direction::Out => ClientEvent::PunchOut {
                classroom_id: classroom_id.to_string(),
                location,
                request_id: pending.request_id.clone(),
            },
        };

        if let Err(err) = self.connection.emit(request) {
            self.book
                .rollback(direction, classroom_id, &pending.request_id)
                .await;
            log_warn!("Punch-{} for {classroom_id} not sent: {err}", direction.as_str());
            return Err(err);
        }

        log_info!(
            "Punch-{} requested for {classroom_id} ({})",
            direction.as_str(),
            pending.request_id
        );

        Ok(PunchReceipt {
            classroom_id: classroom_id.to_string(),
            direction,
            request_id: pending.request_id,
            status: self.book.status(classroom_id).await,
        })
    }

    /// Server `punch_in` / `punch_out` event. Applies even without a prior
    /// local action, as long as the classroom's window is open.
    pub async fn on_confirmed(&self, direction: Direction, classroom_id: &str) -> PunchState {
        self.windows.apply_confirmation(direction, classroom_id).await;
        self.book.status(classroom_id).await
    }

    /// Server `error` event. The event names no classroom, so every
    /// unconfirmed step is rolled back; a late confirmation re-applies it.
    pub async fn on_server_error(&self, message: &str) -> Vec<String> {
        let rolled_back = self.book.rollback_all_pending().await;
        if !rolled_back.is_empty() {
            log_warn!(
                "Server error '{message}' rolled back {} pending punches",
                rolled_back.len()
            );
        }
        let mut classrooms: Vec<String> = rolled_back
            .into_iter()
            .map(|(classroom_id, _)| classroom_id)
            .collect();
        classrooms.sort();
        classrooms.dedup();
        classrooms
    }

    pub async fn sweep_stale_locks(&self) -> Vec<(Direction, String)> {
        let swept = self.book.sweep_stale_locks(self.clock.now_ms()).await;
        for (direction, classroom_id) in &swept {
            log_warn!(
                "Punch-{} for {classroom_id} never confirmed; lock released",
                direction.as_str()
            );
        }
        swept
    }
}
