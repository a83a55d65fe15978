use std::time::Duration;

use anyhow::Context;
use fromenv::FromEnv;

use crate::query::Dialect;

/// Engine settings loaded from the environment.
#[derive(Debug, Clone)]
pub struct Options {
    /// Statements running longer than this are reported as slow.
    pub slow_sql_threshold: Duration,

    /// Upper bound on page sizes. `None` leaves page sizes unbounded.
    pub max_page_size: Option<u64>,

    /// Comment prefixed to every statement.
    pub global_comment: Option<String>,

    /// SQL flavor to write. `None` follows the connection's flavor.
    pub dialect: Option<Dialect>,

    /// Default feature switches. Scopes may override them.
    pub features: Features,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            slow_sql_threshold: Duration::from_secs(1),
            max_page_size: None,
            global_comment: None,
            dialect: None,
            features: Features::default(),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, FromEnv)]
pub struct EnvOptions {
    #[env(from = "STRATA_SLOW_SQL_MS", default = "1000")]
    slow_sql_ms: String,
    #[env(from = "STRATA_MAX_PAGE_SIZE", default = "0")]
    max_page_size: String,
    #[env(from = "STRATA_GLOBAL_COMMENT", default = "")]
    global_comment: String,
    #[env(from = "STRATA_DIALECT", default = "")]
    dialect: String,
}

impl strata_sql::FromEnv for Options {
    fn from_env() -> anyhow::Result<Self> {
        let env = EnvOptions::from_env().finalize().context("issue loading engine options")?;

        let slow_sql_ms: u64 =
            env.slow_sql_ms.trim().parse().context("STRATA_SLOW_SQL_MS is not a number")?;
        let max_page_size: u64 =
            env.max_page_size.trim().parse().context("STRATA_MAX_PAGE_SIZE is not a number")?;
        let global_comment = env.global_comment.trim();
        let dialect = env.dialect.trim();

        Ok(Self {
            slow_sql_threshold: Duration::from_millis(slow_sql_ms),
            max_page_size: (max_page_size > 0).then_some(max_page_size),
            global_comment: (!global_comment.is_empty()).then(|| global_comment.to_string()),
            dialect: (!dialect.is_empty()).then(|| dialect.parse()).transpose()?,
            features: Features::default(),
        })
    }
}

/// Behavior switches that can be flipped per engine or per scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Wrap computed `SUM(...)` expressions in `COALESCE(..., 0)`.
    SumNullToZero,
    /// Log executed statements at `info` instead of `debug`.
    LogSqlAtInfo,
    /// Fail mapping when a declared column is missing from a result row.
    UnknownColumnFatal,
    /// Order paginated reads by key when the caller gave no ORDER BY or GROUP BY.
    AutoOrderForPagination,
}

/// Effective value of every [`Feature`].
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    sum_null_to_zero: bool,
    log_sql_at_info: bool,
    unknown_column_fatal: bool,
    auto_order_for_pagination: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            sum_null_to_zero: true,
            log_sql_at_info: false,
            unknown_column_fatal: false,
            auto_order_for_pagination: true,
        }
    }
}

impl Features {
    /// Whether `feature` is on.
    #[must_use]
    pub const fn is_on(&self, feature: Feature) -> bool {
        match feature {
            Feature::SumNullToZero => self.sum_null_to_zero,
            Feature::LogSqlAtInfo => self.log_sql_at_info,
            Feature::UnknownColumnFatal => self.unknown_column_fatal,
            Feature::AutoOrderForPagination => self.auto_order_for_pagination,
        }
    }

    /// Turn `feature` on or off.
    pub const fn set(&mut self, feature: Feature, on: bool) {
        match feature {
            Feature::SumNullToZero => self.sum_null_to_zero = on,
            Feature::LogSqlAtInfo => self.log_sql_at_info = on,
            Feature::UnknownColumnFatal => self.unknown_column_fatal = on,
            Feature::AutoOrderForPagination => self.auto_order_for_pagination = on,
        }
    }

    /// Copy with `feature` set.
    #[must_use]
    pub const fn with(mut self, feature: Feature, on: bool) -> Self {
        self.set(feature, on);
        self
    }
}
