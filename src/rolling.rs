// 7.0 rolling.rs: read-optimized trailing-window aggregates over the metrics history.
// each window is materialized separately and refreshed on its own schedule. staleness is
// metadata, reads never block on a refresh. rows are computed first, then swapped in
// under a short write lock.
//
// health: lag < interval = healthy, lag < interval * warning_multiple = warning,
// anything else (or never refreshed, or empty) = degraded.

use crate::metrics::{drawdown, link, MetricsEngine, MetricsHistory};
use crate::types::{PackId, PortfolioId, Timestamp};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RollingWindow {
    D30,
    D60,
    D90,
    Y1,
}

impl RollingWindow {
    pub const ALL: [RollingWindow; 4] = [RollingWindow::D30, RollingWindow::D60, RollingWindow::D90, RollingWindow::Y1];

    pub fn days(&self) -> u32 {
        match self {
            RollingWindow::D30 => 30,
            RollingWindow::D60 => 60,
            RollingWindow::D90 => 90,
            RollingWindow::Y1 => 365,
        }
    }

    /// First date inside the window ending at `as_of`.
    pub fn start(&self, as_of: NaiveDate) -> NaiveDate {
        as_of - chrono::Duration::days(i64::from(self.days()) - 1)
    }
}

impl fmt::Display for RollingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RollingWindow::D30 => "30d",
            RollingWindow::D60 => "60d",
            RollingWindow::D90 => "90d",
            RollingWindow::Y1 => "1y",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingParams {
    /// Refresh interval per window.
    pub intervals_ms: BTreeMap<RollingWindow, i64>,
    /// Lag beyond interval * this is degraded.
    pub warning_multiple: i64,
}

impl RollingParams {
    pub fn interval_ms(&self, window: RollingWindow) -> i64 {
        self.intervals_ms.get(&window).copied().unwrap_or(24 * HOUR_MS)
    }
}

impl Default for RollingParams {
    fn default() -> Self {
        Self {
            intervals_ms: BTreeMap::from([
                (RollingWindow::D30, HOUR_MS),
                (RollingWindow::D60, 2 * HOUR_MS),
                (RollingWindow::D90, 4 * HOUR_MS),
                (RollingWindow::Y1, 24 * HOUR_MS),
            ]),
            warning_multiple: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateHealth {
    Healthy,
    Warning,
    Degraded,
}

impl fmt::Display for AggregateHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateHealth::Healthy => "healthy",
            AggregateHealth::Warning => "warning",
            AggregateHealth::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingAggregate {
    pub window: RollingWindow,
    pub portfolio_id: PortfolioId,
    pub as_of: NaiveDate,
    /// pack behind the metrics record at `as_of`
    pub pack_id: PackId,
    pub cumulative_return: Decimal,
    pub volatility: Option<Decimal>,
    pub max_drawdown: Decimal,
    pub observations: usize,
    pub last_refreshed_at: Timestamp,
    pub schedule_interval_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStatus {
    pub window: RollingWindow,
    pub last_refreshed_at: Option<Timestamp>,
    pub is_stale: bool,
    pub row_count: usize,
    pub lag_ms: Option<i64>,
    pub schedule_interval_ms: i64,
    pub health: AggregateHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub window: RollingWindow,
    pub range: Option<(NaiveDate, NaiveDate)>,
    pub rows_written: usize,
    pub portfolios: usize,
    pub refreshed_at: Timestamp,
}

/// Where a read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Materialized,
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateRead {
    pub aggregate: Arc<RollingAggregate>,
    pub source: ReadSource,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("Aggregate {window} is degraded (lag {lag_ms:?}ms, {row_count} rows)")]
    Degraded {
        window: RollingWindow,
        lag_ms: Option<i64>,
        row_count: usize,
    },

    #[error("No {window} aggregate for {portfolio_id} on {as_of}")]
    NotFound {
        window: RollingWindow,
        portfolio_id: PortfolioId,
        as_of: NaiveDate,
    },
}

#[derive(Debug, Default)]
struct Materialized {
    rows: BTreeMap<(PortfolioId, NaiveDate), Arc<RollingAggregate>>,
    last_refreshed_at: Option<Timestamp>,
}

pub struct RollingAggregateStore {
    history: Arc<MetricsHistory>,
    engine: MetricsEngine,
    params: RollingParams,
    views: RwLock<BTreeMap<RollingWindow, Materialized>>,
}

impl fmt::Debug for RollingAggregateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollingAggregateStore")
            .field("params", &self.params)
            .field("history_rows", &self.history.len())
            .finish()
    }
}

impl RollingAggregateStore {
    pub fn new(history: Arc<MetricsHistory>, engine: MetricsEngine, params: RollingParams) -> Self {
        Self {
            history,
            engine,
            params,
            views: RwLock::new(BTreeMap::new()),
        }
    }

    /// Recomputes every (portfolio, as_of) row in `range` (all dates when None) and swaps
    /// them in. Running it twice over the same history gives the same rows.
    pub fn refresh(&self, window: RollingWindow, range: Option<(NaiveDate, NaiveDate)>, now: Timestamp) -> RefreshSummary {
        let interval = self.params.interval_ms(window);
        let portfolios = self.history.portfolios();

        let mut fresh: BTreeMap<(PortfolioId, NaiveDate), Arc<RollingAggregate>> = BTreeMap::new();
        for pf in &portfolios {
            let dates = self.history.dates(*pf);
            let in_range = dates.into_iter().filter(|d| match range {
                Some((from, to)) => *d >= from && *d <= to,
                None => true,
            });
            for as_of in in_range {
                if let Some(row) = self.compute_row(window, *pf, as_of, now, interval) {
                    fresh.insert((*pf, as_of), Arc::new(row));
                }
            }
        }
        let rows_written = fresh.len();

        {
            let mut views = self.views.write().unwrap_or_else(PoisonError::into_inner);
            let view = views.entry(window).or_default();
            match range {
                None => {
                    view.rows = fresh;
                    view.last_refreshed_at = Some(now);
                }
                // a partial refresh leaves the rest of the view as old as it was
                Some((from, to)) => {
                    view.rows.retain(|(_, d), _| *d < from || *d > to);
                    view.rows.extend(fresh);
                }
            }
        }

        info!(%window, rows = rows_written, portfolios = portfolios.len(), ?range, "aggregate refreshed");
        RefreshSummary {
            window,
            range,
            rows_written,
            portfolios: portfolios.len(),
            refreshed_at: now,
        }
    }

    pub fn status(&self, window: RollingWindow, now: Timestamp) -> AggregateStatus {
        let interval = self.params.interval_ms(window);
        let views = self.views.read().unwrap_or_else(PoisonError::into_inner);
        let (last_refreshed_at, row_count) = views
            .get(&window)
            .map(|v| (v.last_refreshed_at, v.rows.len()))
            .unwrap_or((None, 0));
        drop(views);

        let lag_ms = last_refreshed_at.map(|at| now.millis_since(at));
        let health = match lag_ms {
            None => AggregateHealth::Degraded,
            Some(_) if row_count == 0 => AggregateHealth::Degraded,
            Some(lag) if lag < interval => AggregateHealth::Healthy,
            Some(lag) if lag < interval.saturating_mul(self.params.warning_multiple) => AggregateHealth::Warning,
            Some(_) => AggregateHealth::Degraded,
        };

        AggregateStatus {
            window,
            last_refreshed_at,
            is_stale: lag_ms.map_or(true, |lag| lag >= interval),
            row_count,
            lag_ms,
            schedule_interval_ms: interval,
            health,
        }
    }

    /// Materialized row. Refuses to serve from a degraded view.
    pub fn get(
        &self,
        window: RollingWindow,
        portfolio_id: PortfolioId,
        as_of: NaiveDate,
        now: Timestamp,
    ) -> Result<Arc<RollingAggregate>, AggregateError> {
        let status = self.status(window, now);
        if status.health == AggregateHealth::Degraded {
            return Err(AggregateError::Degraded {
                window,
                lag_ms: status.lag_ms,
                row_count: status.row_count,
            });
        }
        if status.health == AggregateHealth::Warning {
            debug!(%window, lag_ms = ?status.lag_ms, "serving aggregate past its refresh interval");
        }

        let views = self.views.read().unwrap_or_else(PoisonError::into_inner);
        views
            .get(&window)
            .and_then(|v| v.rows.get(&(portfolio_id, as_of)))
            .cloned()
            .ok_or(AggregateError::NotFound {
                window,
                portfolio_id,
                as_of,
            })
    }

    /// Materialized row when the view is usable, otherwise computed straight from history.
    pub fn get_or_compute(
        &self,
        window: RollingWindow,
        portfolio_id: PortfolioId,
        as_of: NaiveDate,
        now: Timestamp,
    ) -> Result<AggregateRead, AggregateError> {
        match self.get(window, portfolio_id, as_of, now) {
            Ok(aggregate) => Ok(AggregateRead {
                aggregate,
                source: ReadSource::Materialized,
            }),
            Err(err) => {
                warn!(%window, portfolio = %portfolio_id, %as_of, error = %err, "falling back to direct aggregate computation");
                let interval = self.params.interval_ms(window);
                self.compute_row(window, portfolio_id, as_of, now, interval)
                    .map(|row| AggregateRead {
                        aggregate: Arc::new(row),
                        source: ReadSource::Computed,
                    })
                    .ok_or(AggregateError::NotFound {
                        window,
                        portfolio_id,
                        as_of,
                    })
            }
        }
    }

    /// Windows whose lag reached their interval, or that were never refreshed.
    pub fn due_windows(&self, now: Timestamp) -> Vec<RollingWindow> {
        RollingWindow::ALL
            .into_iter()
            .filter(|w| self.status(*w, now).is_stale)
            .collect()
    }

    pub fn run_due(&self, now: Timestamp) -> Vec<RefreshSummary> {
        self.due_windows(now)
            .into_iter()
            .map(|w| self.refresh(w, None, now))
            .collect()
    }

    fn compute_row(
        &self,
        window: RollingWindow,
        portfolio_id: PortfolioId,
        as_of: NaiveDate,
        now: Timestamp,
        interval: i64,
    ) -> Option<RollingAggregate> {
        let anchor = self.history.get(portfolio_id, as_of)?;
        let start = window.start(as_of);
        let series = self.history.series(portfolio_id, start, as_of);
        let returns: Vec<(NaiveDate, Decimal)> = series.iter().map(|r| (r.as_of, r.period_return)).collect();
        let values: Vec<Decimal> = returns.iter().map(|(_, r)| *r).collect();

        Some(RollingAggregate {
            window,
            portfolio_id,
            as_of,
            pack_id: anchor.pack_id,
            cumulative_return: link(values.iter().copied()).round_dp(12),
            volatility: self.engine.annualized_volatility(&values).map(|v| v.round_dp(12)),
            max_drawdown: drawdown(start, &returns).max_drawdown,
            observations: values.len(),
            last_refreshed_at: now,
            schedule_interval_ms: interval,
        })
    }
}
