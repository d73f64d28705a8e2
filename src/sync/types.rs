use crate::config::ConfigError;
use crate::feed::FeedError;
use crate::sync::repositories::StoreError;

/// Fatal supervisor outcomes
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
	#[error("Reconnection budget exhausted after {attempts} attempts: {last_error}")]
	Exhausted { attempts: u32, last_error: String },
}

/// Error types for the sync service
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Feed error: {0}")]
	Feed(#[from] FeedError),

	#[error("Store error: {0}")]
	Store(#[from] StoreError),

	#[error("Configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("Supervisor error: {0}")]
	Supervisor(#[from] SupervisorError),
}
