//! Lock retries
//!
//! Runs a block in a transaction with a short `lock_timeout`, retrying with
//! longer timeouts and sleeps in between when the lock cannot be acquired.

use std::time::Duration;

use tidemark_core::{LockRetriesConfig, TimingStep};

use crate::error::{MigrationError, MigrationResult};

use super::{BoxFuture, MigrationContext};

/// (lock_timeout_ms, sleep_ms): short timeouts first, with long waits
/// between rounds once the table is clearly busy
const DEFAULT_TIMING: &[(u64, u64)] = &[
    (100, 50),
    (100, 50),
    (200, 50),
    (300, 100),
    (400, 150),
    (500, 2_000),
    (500, 2_000),
    (500, 2_000),
    (500, 2_000),
    (1_000, 5_000),
    (1_000, 60_000),
    (100, 50),
    (100, 50),
    (200, 50),
    (300, 100),
    (400, 150),
    (500, 2_000),
    (500, 2_000),
    (500, 2_000),
    (3_000, 180_000),
    (100, 50),
    (100, 50),
    (200, 50),
    (300, 100),
    (400, 150),
    (500, 2_000),
    (500, 2_000),
    (500, 2_000),
    (5_000, 120_000),
    (100, 50),
    (100, 50),
    (200, 50),
    (300, 100),
    (400, 150),
    (500, 2_000),
    (500, 2_000),
    (500, 2_000),
    (7_000, 300_000),
    (100, 50),
    (100, 50),
    (200, 50),
    (300, 100),
    (400, 150),
    (500, 2_000),
    (500, 2_000),
    (500, 2_000),
    (10_000, 420_000),
];

/// Ordered retry schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRetryTiming {
    steps: Vec<TimingStep>,
}

impl Default for LockRetryTiming {
    fn default() -> Self {
        Self {
            steps: DEFAULT_TIMING
                .iter()
                .map(|&(lock_timeout_ms, sleep_ms)| TimingStep {
                    lock_timeout_ms,
                    sleep_ms,
                })
                .collect(),
        }
    }
}

impl LockRetryTiming {
    pub fn new(steps: Vec<TimingStep>) -> Self {
        Self { steps }
    }

    /// Configured steps, or the built-in schedule when none are given
    pub fn from_steps(steps: &[TimingStep]) -> Self {
        if steps.is_empty() {
            Self::default()
        } else {
            Self::new(steps.to_vec())
        }
    }

    pub fn steps(&self) -> &[TimingStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Worst-case time spent sleeping between attempts
    pub fn total_sleep(&self) -> Duration {
        Duration::from_millis(self.steps.iter().map(|s| s.sleep_ms).sum())
    }
}

/// Settings for one `with_lock_retries` call
#[derive(Debug, Clone, PartialEq)]
pub struct LockRetryOptions {
    pub enabled: bool,
    pub raise_on_exhaustion: bool,
    pub timing: LockRetryTiming,
}

impl LockRetryOptions {
    pub fn from_config(config: &LockRetriesConfig) -> Self {
        Self {
            enabled: config.enabled,
            raise_on_exhaustion: config.raise_on_exhaustion,
            timing: LockRetryTiming::from_steps(&config.timing),
        }
    }

    pub fn timing(mut self, timing: LockRetryTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn raise_on_exhaustion(mut self, raise: bool) -> Self {
        self.raise_on_exhaustion = raise;
        self
    }
}

impl MigrationContext {
    /// `with_lock_retries_using` with the context's configured settings
    pub async fn with_lock_retries<T, F>(&mut self, block: F) -> MigrationResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, MigrationResult<T>> + Send,
    {
        let options = LockRetryOptions::from_config(self.lock_retries_config());
        self.with_lock_retries_using(options, block).await
    }

    /// Run `block` in its own transaction, retrying on lock timeouts.
    ///
    /// Each attempt sets `lock_timeout` for the transaction. After the last
    /// step a final attempt runs without a lock timeout, unless
    /// `raise_on_exhaustion` is set. Errors other than lock timeouts roll
    /// back and propagate immediately.
    pub async fn with_lock_retries_using<T, F>(
        &mut self,
        options: LockRetryOptions,
        mut block: F,
    ) -> MigrationResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, MigrationResult<T>> + Send,
    {
        self.ensure_no_transaction("with_lock_retries")?;

        if !options.enabled {
            tracing::info!("lock retries disabled, running the block once without lock_timeout");
            return self.lock_retry_attempt(None, &mut block).await;
        }

        let steps = options.timing.steps();
        for (index, step) in steps.iter().enumerate() {
            let attempt = index + 1;
            tracing::info!(
                attempt,
                lock_timeout_ms = step.lock_timeout_ms,
                "acquiring lock"
            );

            match self.lock_retry_attempt(Some(step.lock_timeout_ms), &mut block).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_lock_timeout() => {
                    tracing::warn!(
                        attempt,
                        lock_timeout_ms = step.lock_timeout_ms,
                        sleep_ms = step.sleep_ms,
                        "lock timeout, retrying after sleep"
                    );
                    if step.sleep_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(step.sleep_ms)).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        if options.raise_on_exhaustion {
            return Err(MigrationError::LockRetriesExhausted {
                attempts: steps.len(),
            });
        }

        tracing::warn!(
            attempts = steps.len(),
            "lock retries exhausted, running without lock_timeout"
        );
        self.lock_retry_attempt(Some(0), &mut block).await
    }

    /// One transaction; `Some(0)` disables the lock timeout explicitly
    async fn lock_retry_attempt<T, F>(
        &mut self,
        lock_timeout_ms: Option<u64>,
        block: &mut F,
    ) -> MigrationResult<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut MigrationContext) -> BoxFuture<'c, MigrationResult<T>> + Send,
    {
        self.begin().await?;

        if let Some(ms) = lock_timeout_ms {
            if self.dialect().supports_lock_timeout() {
                let sql = if ms == 0 {
                    "SET LOCAL lock_timeout TO '0'".to_string()
                } else {
                    format!("SET LOCAL lock_timeout TO '{}ms'", ms)
                };
                if let Err(err) = self.execute(&sql).await {
                    return Err(self.rollback_after_error(err).await);
                }
            }
        }

        match block(self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => Err(self.rollback_after_error(err).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{sqlite_context, RecordingConnection};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_timing(steps: usize) -> LockRetryTiming {
        LockRetryTiming::new(vec![
            TimingStep {
                lock_timeout_ms: 10,
                sleep_ms: 0,
            };
            steps
        ])
    }

    fn options(steps: usize, raise: bool) -> LockRetryOptions {
        LockRetryOptions::from_config(&LockRetriesConfig::default())
            .timing(fast_timing(steps))
            .raise_on_exhaustion(raise)
    }

    #[test]
    fn test_default_timing_starts_short() {
        let timing = LockRetryTiming::default();
        assert!(!timing.is_empty());
        assert_eq!(timing.steps()[0].lock_timeout_ms, 100);
        assert!(timing.steps().last().unwrap().lock_timeout_ms >= 1_000);
        assert_eq!(LockRetryTiming::from_steps(&[]), timing);
    }

    #[tokio::test]
    async fn test_retries_until_block_succeeds() {
        let mut ctx = sqlite_context().await;
        ctx.execute("CREATE TABLE t (id INTEGER)").await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        ctx.with_lock_retries_using(options(5, true), move |ctx| {
            let counter = counter.clone();
            Box::pin(async move {
                ctx.execute("INSERT INTO t VALUES (1)").await?;
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(MigrationError::LockTimeout("busy".to_string()));
                }
                Ok(())
            })
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!ctx.transaction_open());
        // failed attempts were rolled back
        assert_eq!(ctx.select_count("SELECT COUNT(*) FROM t", &[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_raises_when_configured() {
        let mut ctx = sqlite_context().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let err = ctx
            .with_lock_retries_using(options(3, true), move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Err::<(), _>(MigrationError::LockTimeout("busy".to_string())) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::LockRetriesExhausted { attempts: 3 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_makes_final_attempt() {
        let mut ctx = sqlite_context().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let value = ctx
            .with_lock_retries_using(options(2, false), move |_ctx| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if attempt < 2 {
                        Err(MigrationError::LockTimeout("busy".to_string()))
                    } else {
                        Ok(attempt)
                    }
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_propagate_immediately() {
        let mut ctx = sqlite_context().await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let err = ctx
            .with_lock_retries_using(options(5, false), move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { ctx.execute("SELECT * FROM missing_table").await.map(|_| ()) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::Database { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!ctx.transaction_open());
    }

    #[tokio::test]
    async fn test_disabled_runs_once() {
        let mut ctx = sqlite_context().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut disabled = options(5, false);
        disabled.enabled = false;

        let counter = calls.clone();
        let err = ctx
            .with_lock_retries_using(disabled, move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Err::<(), _>(MigrationError::LockTimeout("busy".to_string())) })
            })
            .await
            .unwrap_err();

        assert!(err.is_lock_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refuses_to_run_inside_transaction() {
        let mut ctx = sqlite_context().await;
        ctx.begin().await.unwrap();

        let err = ctx
            .with_lock_retries(|_ctx| Box::pin(async move { Ok::<(), MigrationError>(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::TransactionOpen { .. }));
        ctx.rollback().await.unwrap();
    }

    const ADD_COLUMN: &str = "ALTER TABLE \"t\" ADD COLUMN \"a\" integer";

    fn stepped_options(timeouts: &[u64], raise: bool) -> LockRetryOptions {
        let steps = timeouts
            .iter()
            .map(|&lock_timeout_ms| TimingStep {
                lock_timeout_ms,
                sleep_ms: 0,
            })
            .collect();
        options(0, raise).timing(LockRetryTiming::new(steps))
    }

    async fn add_column(ctx: &mut MigrationContext, options: LockRetryOptions) -> MigrationResult<()> {
        ctx.with_lock_retries_using(options, |ctx| {
            Box::pin(async move { ctx.execute(ADD_COLUMN).await.map(|_| ()) })
        })
        .await
    }

    #[tokio::test]
    async fn test_postgres_attempts_escalate_then_drop_timeout() {
        let conn = RecordingConnection::new().lock_timeout_on("ALTER TABLE", 2);
        let executed = conn.executed();
        let mut ctx = conn.into_context();

        add_column(&mut ctx, stepped_options(&[10, 20], false)).await.unwrap();

        assert_eq!(
            executed.statements(),
            vec![
                "BEGIN",
                "SET LOCAL lock_timeout TO '10ms'",
                ADD_COLUMN,
                "ROLLBACK",
                "BEGIN",
                "SET LOCAL lock_timeout TO '20ms'",
                ADD_COLUMN,
                "ROLLBACK",
                "BEGIN",
                "SET LOCAL lock_timeout TO '0'",
                ADD_COLUMN,
                "COMMIT",
            ]
        );
        assert!(!ctx.transaction_open());
    }

    #[tokio::test]
    async fn test_postgres_exhaustion_leaves_no_transaction() {
        let conn = RecordingConnection::new().lock_timeout_on("ALTER TABLE", 10);
        let executed = conn.executed();
        let mut ctx = conn.into_context();

        let err = add_column(&mut ctx, stepped_options(&[10, 20], true)).await.unwrap_err();

        assert!(matches!(err, MigrationError::LockRetriesExhausted { attempts: 2 }));
        let statements = executed.statements();
        assert_eq!(statements.iter().filter(|s| *s == "BEGIN").count(), 2);
        assert!(!statements.iter().any(|s| s.contains("lock_timeout TO '0'")));
        assert_eq!(statements.last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_postgres_disabled_sets_no_timeout() {
        let conn = RecordingConnection::new();
        let executed = conn.executed();
        let mut ctx = conn.into_context();
        let mut disabled = stepped_options(&[10], false);
        disabled.enabled = false;

        add_column(&mut ctx, disabled).await.unwrap();

        assert_eq!(executed.statements(), vec!["BEGIN", ADD_COLUMN, "COMMIT"]);
    }
}
