use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ChuteSelectionStrategy, FallbackCause, SelectionRequest, SelectionResult};

/// Cycles through the available chutes with one cursor shared by every
/// parcel. The cursor is an atomic counter; each call claims exactly one
/// slot, so concurrent parcels still see a pure rotation. It never resets.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select_now(&self, req: &SelectionRequest) -> SelectionResult {
        if let Some(forced) = SelectionResult::overload_forced(req) {
            return forced;
        }

        let chutes = &req.available_chutes;
        if chutes.is_empty() {
            return SelectionResult::exception(
                req,
                FallbackCause::NoAvailableChutes,
                "no available chutes for round-robin",
            );
        }

        // fetch_add wraps on overflow
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed);
        SelectionResult::chute(chutes[slot % chutes.len()], "round-robin")
    }
}

#[async_trait]
impl ChuteSelectionStrategy for RoundRobinStrategy {
    async fn select(&self, req: &SelectionRequest, _cancel: &CancellationToken) -> SelectionResult {
        self.select_now(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortline_core::config::SortingMode;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn req(chutes: Vec<i64>) -> SelectionRequest {
        SelectionRequest {
            parcel_id: 1,
            mode: SortingMode::RoundRobin,
            exception_chute_id: 999,
            fixed_chute_id: None,
            available_chutes: chutes,
            overload_forced: false,
        }
    }

    #[test]
    fn wraps_around_available_chutes() {
        let rr = RoundRobinStrategy::new();
        let r = req(vec![1, 2, 3]);
        let picks: Vec<_> = (0..4).map(|_| rr.select_now(&r).target_chute_id).collect();
        assert_eq!(picks, vec![1, 2, 3, 1]);
    }

    #[test]
    fn empty_list_goes_to_exception() {
        let rr = RoundRobinStrategy::new();
        let out = rr.select_now(&req(vec![]));
        assert!(out.is_exception);
        assert_eq!(out.target_chute_id, 999);
        assert_eq!(out.cause, Some(FallbackCause::NoAvailableChutes));
    }

    #[test]
    fn forced_request_does_not_advance_cursor() {
        let rr = RoundRobinStrategy::new();
        let mut forced = req(vec![1, 2, 3]);
        forced.overload_forced = true;
        assert_eq!(rr.select_now(&forced).target_chute_id, 999);
        assert_eq!(rr.select_now(&req(vec![1, 2, 3])).target_chute_id, 1);
    }

    #[test]
    fn concurrent_callers_get_an_even_rotation() {
        let rr = Arc::new(RoundRobinStrategy::new());
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let rr = rr.clone();
                std::thread::spawn(move || {
                    let r = req(vec![10, 20, 30]);
                    (0..300).map(|_| rr.select_now(&r).target_chute_id).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts: HashMap<i64, usize> = HashMap::new();
        for h in handles {
            for chute in h.join().unwrap() {
                *counts.entry(chute).or_default() += 1;
            }
        }
        // 1800 picks over 3 chutes: exactly 600 each
        assert_eq!(counts.get(&10), Some(&600));
        assert_eq!(counts.get(&20), Some(&600));
        assert_eq!(counts.get(&30), Some(&600));
    }
}
