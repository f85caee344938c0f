use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{connection::Location, error::PresenceError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    Denied(String),
    Unavailable(String),
}

impl From<LocationError> for PresenceError {
    fn from(err: LocationError) -> Self {
        match err {
            LocationError::Denied(reason) => PresenceError::LocationDenied(reason),
            LocationError::Unavailable(reason) => PresenceError::LocationUnavailable(reason),
        }
    }
}

/// Single-shot device position lookup. May be slow and may be refused.
#[async_trait]
pub trait GeolocationProvider: Send + Sync {
    async fn current_position(&self) -> Result<Location, LocationError>;
}

/// Headless provider returning configured coordinates, or `Unavailable` when
/// none are configured.
#[derive(Debug, Clone, Default)]
pub struct FixedLocation {
    location: Option<Location>,
}

impl FixedLocation {
    pub fn new(location: Option<Location>) -> Self {
        Self { location }
    }
}

#[async_trait]
impl GeolocationProvider for FixedLocation {
    async fn current_position(&self) -> Result<Location, LocationError> {
        self.location
            .ok_or_else(|| LocationError::Unavailable("no location configured".into()))
    }
}

/// Replays queued answers in order, then falls back to a default answer.
pub struct ScriptedLocation {
    queued: Mutex<VecDeque<Result<Location, LocationError>>>,
    fallback: Result<Location, LocationError>,
}

impl ScriptedLocation {
    pub fn always(answer: Result<Location, LocationError>) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: answer,
        }
    }

    pub fn then(self, answer: Result<Location, LocationError>) -> Self {
        if let Ok(mut queued) = self.queued.lock() {
            queued.push_back(answer);
        }
        self
    }
}

#[async_trait]
impl GeolocationProvider for ScriptedLocation {
    async fn current_position(&self) -> Result<Location, LocationError> {
        let next = self
            .queued
            .lock()
            .ok()
            .and_then(|mut queued| queued.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }
}
