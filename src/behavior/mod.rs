use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::core::{Outcome, Target};
use crate::http::HttpClient;
use crate::session::SessionError;

pub trait Weighted {
    fn weight(&self) -> u32;
}

/// Stateless weighted choice over a fixed, non-empty list.
#[derive(Debug, Clone)]
pub struct WeightedSelector<T> {
    items: Vec<T>,
    total: u64,
}

impl<T: Weighted> WeightedSelector<T> {
    pub fn new(items: Vec<T>) -> Result<Self, SessionError> {
        if items.is_empty() {
            return Err(SessionError::configuration("選択肢が 1 件もありません"));
        }
        let total: u64 = items.iter().map(|b| u64::from(b.weight())).sum();
        if total == 0 {
            return Err(SessionError::configuration("重みの合計が 0 です"));
        }
        Ok(Self { items, total })
    }

    /// A selector that always yields `item`.
    pub fn single(item: T) -> Self {
        let total = u64::from(item.weight()).max(1);
        Self {
            items: vec![item],
            total,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn total_weight(&self) -> u64 {
        self.total
    }

    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> &T {
        let draw = rng.random_range(0..self.total);
        let mut cumulative = 0u64;
        for item in &self.items {
            cumulative += u64::from(item.weight());
            if draw < cumulative {
                return item;
            }
        }
        // draw < total, so the loop always returns.
        &self.items[self.items.len() - 1]
    }
}

pub struct ActionContext<'a> {
    pub target: &'a Target,
    pub client: &'a dyn HttpClient,
    pub actor: u32,
    pub behavior: &'a str,
}

#[async_trait]
pub trait BehaviorAction: Send + Sync {
    async fn run(&self, ctx: &ActionContext<'_>) -> Outcome;
}

#[derive(Clone)]
pub struct Behavior {
    pub name: String,
    pub weight: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub action: Arc<dyn BehaviorAction>,
}

impl fmt::Debug for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Behavior")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("min_wait", &self.min_wait)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl Behavior {
    pub fn new(
        name: impl Into<String>,
        weight: u32,
        min_wait: Duration,
        max_wait: Duration,
        action: Arc<dyn BehaviorAction>,
    ) -> Result<Self, SessionError> {
        let name = name.into();
        if weight == 0 {
            return Err(SessionError::configuration(format!(
                "behavior `{name}` の weight は 1 以上にしてください"
            )));
        }
        if min_wait > max_wait {
            return Err(SessionError::configuration(format!(
                "behavior `{name}` の min_wait が max_wait を超えています"
            )));
        }
        Ok(Self {
            name,
            weight,
            min_wait,
            max_wait,
            action,
        })
    }

    pub fn think_time<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        wait_between(self.min_wait, self.max_wait, rng)
    }
}

/// Uniform draw in `[min, max]` at millisecond resolution.
pub fn wait_between<R: Rng + ?Sized>(min: Duration, max: Duration, rng: &mut R) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if lo >= hi {
        return min;
    }
    Duration::from_millis(rng.random_range(lo..=hi))
}

impl Weighted for Behavior {
    fn weight(&self) -> u32 {
        self.weight
    }
}
