use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopStatus {
    Running,
    Stopped,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopStatus::Running => write!(f, "Running"),
            LoopStatus::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopState {
    pub status: LoopStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub trades: u64,
}

/// Start/stop flag shared between the decision loop and whoever
/// drives it (signal handler, CLI). A stop is honoured between plan items.
pub struct LoopController {
    is_running: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
    ticks: AtomicU64,
    trades: AtomicU64,
    status_tx: broadcast::Sender<LoopStatus>,
}

impl LoopController {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(32);
        Self {
            is_running: AtomicBool::new(false),
            started_at: RwLock::new(None),
            last_tick_at: RwLock::new(None),
            ticks: AtomicU64::new(0),
            trades: AtomicU64::new(0),
            status_tx,
        }
    }

    #[cfg(test)]
    pub fn new_running() -> Self {
        let controller = Self::new();
        controller.is_running.store(true, Ordering::Release);
        controller
    }

    pub async fn start(&self) -> Result<(), String> {
        if self.is_running.load(Ordering::Acquire) {
            return Err("Decision loop is already running".to_string());
        }

        self.is_running.store(true, Ordering::Release);
        *self.started_at.write().await = Some(Utc::now());

        info!("Decision loop started");
        let _ = self.status_tx.send(LoopStatus::Running);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), String> {
        if !self.is_running.load(Ordering::Acquire) {
            return Err("Decision loop is not running".to_string());
        }

        self.is_running.store(false, Ordering::Release);

        info!("Decision loop stopping");
        let _ = self.status_tx.send(LoopStatus::Stopped);
        Ok(())
    }

    /// Whether the current tick may proceed to its next plan item.
    pub fn should_continue(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub async fn record_tick(&self) -> u64 {
        *self.last_tick_at.write().await = Some(Utc::now());
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn increment_trades(&self) {
        self.trades.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn get_state(&self) -> LoopState {
        let status = if self.is_running.load(Ordering::Acquire) {
            LoopStatus::Running
        } else {
            LoopStatus::Stopped
        };

        LoopState {
            status,
            started_at: *self.started_at.read().await,
            last_tick_at: *self.last_tick_at.read().await,
            ticks: self.ticks.load(Ordering::Relaxed),
            trades: self.trades.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopStatus> {
        self.status_tx.subscribe()
    }
}

impl Default for LoopController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle() {
        let controller = LoopController::new();
        assert!(!controller.should_continue());
        assert!(controller.stop().is_err());

        controller.start().await.unwrap();
        assert!(controller.should_continue());
        assert!(controller.start().await.is_err());

        let state = controller.get_state().await;
        assert_eq!(state.status, LoopStatus::Running);
        assert!(state.started_at.is_some());

        controller.stop().unwrap();
        assert!(!controller.should_continue());
        assert_eq!(controller.get_state().await.status, LoopStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_broadcast() {
        let controller = LoopController::new_running();
        let mut rx = controller.subscribe();
        controller.stop().unwrap();
        assert_eq!(rx.recv().await.unwrap(), LoopStatus::Stopped);
    }

    #[tokio::test]
    async fn test_counters() {
        let controller = LoopController::new_running();
        assert_eq!(controller.record_tick().await, 1);
        assert_eq!(controller.record_tick().await, 2);
        controller.increment_trades();

        let state = controller.get_state().await;
        assert_eq!(state.ticks, 2);
        assert_eq!(state.trades, 1);
        assert!(state.last_tick_at.is_some());
    }
}
