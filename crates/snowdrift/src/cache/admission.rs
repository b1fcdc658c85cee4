//! Disk-budget admission policy.
//!
//! Greedy and order preserving: the first waiting entry is considered, and if
//! it cannot be admitted nothing behind it is either.

/// What to do with the entry at the head of the waiting list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to cache.
    Skip,
    /// Reserve `allocated` bytes and download that prefix.
    Admit { allocated: u64 },
    /// Leave this entry waiting and stop for now.
    Stop,
}

/// Decide for an object of `size` bytes given the `remaining` budget.
pub fn decide(size: u64, remaining: u64, min_truncation: u64) -> Decision {
    if size == 0 {
        return Decision::Skip;
    }
    let allocatable = remaining.min(size);
    if allocatable == 0 {
        return Decision::Stop;
    }
    if allocatable < size && allocatable < min_truncation {
        return Decision::Stop;
    }
    Decision::Admit { allocated: allocatable }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decisions() {
        assert_eq!(decide(0, 100, 10), Decision::Skip);
        assert_eq!(decide(50, 100, 10), Decision::Admit { allocated: 50 });
        assert_eq!(decide(150, 100, 10), Decision::Admit { allocated: 100 });
        assert_eq!(decide(150, 0, 10), Decision::Stop);
        // A sliver below the truncation threshold is not worth a connection.
        assert_eq!(decide(10_000, 2_000, 5_000), Decision::Stop);
        // The threshold only applies to truncated entries.
        assert_eq!(decide(3, 5, 10), Decision::Admit { allocated: 3 });
    }

    /// Replays admission with downloads completing and being reclaimed in
    /// admission order, checking the budget after every step.
    #[test]
    fn test_budget_invariant_over_replay() {
        let budget = 1_000u64;
        let min_truncation = 300u64;
        let size_sets: [&[u64]; 4] = [
            &[400, 400, 400, 400],
            &[1_500, 10, 0, 999, 250],
            &[200, 900, 100, 700, 50, 50],
            &[0, 0, 1_000, 1],
        ];

        for sizes in size_sets {
            let mut waiting: Vec<u64> = sizes.to_vec();
            let mut admitted: Vec<(u64, u64)> = Vec::new();
            let mut committed = 0u64;
            let mut rounds = 0;

            while !waiting.is_empty() {
                rounds += 1;
                assert!(rounds < 100, "admission never progressed for {sizes:?}");

                while let Some(&size) = waiting.first() {
                    match decide(size, budget - committed, min_truncation) {
                        Decision::Skip => {
                            waiting.remove(0);
                        }
                        Decision::Admit { allocated } => {
                            assert!(allocated == size || allocated >= min_truncation);
                            committed += allocated;
                            assert!(committed <= budget);
                            admitted.push((size, allocated));
                            waiting.remove(0);
                        }
                        Decision::Stop => break,
                    }
                }

                // Reclaim the oldest admission to make room.
                if !admitted.is_empty() {
                    let (_, allocated) = admitted.remove(0);
                    committed -= allocated;
                } else if let Some(&size) = waiting.first() {
                    // Nothing held and still blocked: the head can never fit.
                    assert!(budget < size && budget < min_truncation);
                    break;
                }
            }
        }
    }
}
