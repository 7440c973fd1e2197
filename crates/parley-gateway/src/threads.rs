//! Conversation threads: one bounded history per (user, thread id)
//!
//! Keys are normalized and hardened against traversal and control
//! characters. Threads are created on first commit and evicted after a period
//! of inactivity or when the store is full (least recently active first).

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::ChatMessage;

/// Maximum length of each key component
const MAX_KEY_PART_LEN: usize = 128;

/// History retention settings
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// Messages kept after each turn
    pub keep_recent: usize,
    /// Inactivity after which a thread is evicted
    pub idle: Duration,
    pub max_threads: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            keep_recent: 3,
            idle: Duration::from_secs(60 * 60),
            max_threads: 1000,
        }
    }
}

/// Why a (user, thread id) pair cannot name a thread
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadKeyError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("{0} too long")]
    TooLong(&'static str),

    #[error("{0} contains invalid characters")]
    InvalidCharacters(&'static str),

    #[error("{0} contains control characters")]
    ControlCharacters(&'static str),
}

struct Thread {
    messages: Vec<ChatMessage>,
    last_activity: DateTime<Utc>,
    turns: u64,
}

/// Owns all conversation threads
pub struct ThreadStore {
    threads: Arc<RwLock<HashMap<String, Thread>>>,
    config: ThreadConfig,
}

fn normalize_part(part: &str, what: &'static str) -> Result<String, ThreadKeyError> {
    let normalized = part.trim().to_lowercase();

    if normalized.is_empty() {
        return Err(ThreadKeyError::Empty(what));
    }
    if normalized.len() > MAX_KEY_PART_LEN {
        return Err(ThreadKeyError::TooLong(what));
    }
    if normalized.contains('/')
        || normalized.contains('\\')
        || normalized.contains("..")
        || normalized.contains('\0')
    {
        return Err(ThreadKeyError::InvalidCharacters(what));
    }
    if normalized.chars().any(|c| c.is_control()) {
        return Err(ThreadKeyError::ControlCharacters(what));
    }

    Ok(normalized)
}

/// Normalize a (user, thread id) pair into a store key
pub fn normalize_thread_key(user: &str, thread_id: &str) -> Result<String, ThreadKeyError> {
    let user = normalize_part(user, "User")?;
    let thread = normalize_part(thread_id, "Thread ID")?;
    Ok(format!("{user}/{thread}"))
}

impl ThreadStore {
    pub fn new(config: ThreadConfig) -> Self {
        Self {
            threads: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Retained history of a thread (empty if it does not exist yet)
    pub async fn history(
        &self,
        user: &str,
        thread_id: &str,
    ) -> Result<Vec<ChatMessage>, ThreadKeyError> {
        let key = normalize_thread_key(user, thread_id)?;
        let threads = self.threads.read().await;
        Ok(threads
            .get(&key)
            .map(|t| t.messages.clone())
            .unwrap_or_default())
    }

    /// Append a completed turn and truncate to the recent window.
    ///
    /// Returns the number of retained messages.
    pub async fn commit(
        &self,
        user: &str,
        thread_id: &str,
        input: Vec<ChatMessage>,
        reply: ChatMessage,
    ) -> Result<usize, ThreadKeyError> {
        let key = normalize_thread_key(user, thread_id)?;
        let now = Utc::now();
        let mut threads = self.threads.write().await;

        if !threads.contains_key(&key) && threads.len() >= self.config.max_threads {
            let oldest = threads
                .iter()
                .min_by_key(|(_, t)| t.last_activity)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                warn!("Thread store full, evicting '{}'", oldest);
                threads.remove(&oldest);
            }
        }

        let thread = threads.entry(key.clone()).or_insert_with(|| {
            info!("Created thread '{}'", key);
            Thread {
                messages: Vec::new(),
                last_activity: now,
                turns: 0,
            }
        });

        thread.messages.extend(input);
        thread.messages.push(reply);
        let excess = thread.messages.len().saturating_sub(self.config.keep_recent);
        thread.messages.drain(..excess);
        thread.last_activity = now;
        thread.turns += 1;

        debug!(
            "Thread '{}' turn {} (retained: {})",
            key,
            thread.turns,
            thread.messages.len()
        );
        Ok(thread.messages.len())
    }

    /// Evict threads idle for longer than the configured window
    pub async fn evict_idle(&self) -> usize {
        let idle = chrono::Duration::from_std(self.config.idle)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - idle;
        let mut threads = self.threads.write().await;
        let before = threads.len();
        threads.retain(|_, t| t.last_activity >= cutoff);
        before - threads.len()
    }

    /// Run `evict_idle` every `interval` until `shutdown` fires
    pub fn spawn_janitor(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.evict_idle().await;
                        if evicted > 0 {
                            info!("Evicted {} idle thread(s)", evicted);
                        }
                    }
                }
            }
        })
    }
}
