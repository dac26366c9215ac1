use std::time::Duration;

/// A linear ramp segment: over `duration`, the VU target moves from the
/// previous stage's target to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

/// Deterministic ramp plan: stages are applied strictly in order, starting
/// from a baseline of zero VUs before the first stage.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    stages: Vec<Stage>,
}

impl Schedule {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Iterate stages strictly in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Total duration of all stages.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Target VU count at a given elapsed time, linearly interpolated within
    /// the active stage. `None` once the schedule is exhausted.
    pub fn target_at(&self, elapsed: Duration) -> Option<u64> {
        let mut offset = Duration::ZERO;
        let mut prev = 0u64;
        for stage in &self.stages {
            let end = offset + stage.duration;
            if elapsed < end {
                let frac = if stage.duration.is_zero() {
                    1.0
                } else {
                    (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64()
                };
                let from = prev as f64;
                let to = stage.target as f64;
                return Some((from + (to - from) * frac).round() as u64);
            }
            offset = end;
            prev = stage.target;
        }
        None
    }

    /// Index of the stage covering the given elapsed time.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let mut offset = Duration::ZERO;
        for (idx, stage) in self.stages.iter().enumerate() {
            offset += stage.duration;
            if elapsed < offset {
                return Some(idx);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> Schedule {
        Schedule::new(vec![
            Stage {
                duration: Duration::from_secs(10),
                target: 100,
            },
            Stage {
                duration: Duration::from_secs(10),
                target: 0,
            },
        ])
    }

    #[test]
    fn test_total_duration() {
        assert_eq!(schedule().total_duration(), Duration::from_secs(20));
    }

    #[test]
    fn test_target_interpolates_from_zero() {
        let schedule = schedule();
        assert_eq!(schedule.target_at(Duration::ZERO), Some(0));
        assert_eq!(schedule.target_at(Duration::from_secs(5)), Some(50));
        assert_eq!(schedule.target_at(Duration::from_millis(9999)), Some(100));
    }

    #[test]
    fn test_target_ramps_down_from_previous_stage() {
        let schedule = schedule();
        assert_eq!(schedule.target_at(Duration::from_secs(10)), Some(100));
        assert_eq!(schedule.target_at(Duration::from_secs(15)), Some(50));
        assert_eq!(schedule.target_at(Duration::from_millis(19999)), Some(0));
        assert_eq!(schedule.target_at(Duration::from_secs(20)), None);
    }

    #[test]
    fn test_empty_schedule_has_no_target() {
        let schedule = Schedule::new(Vec::new());
        assert_eq!(schedule.target_at(Duration::ZERO), None);
        assert_eq!(schedule.total_duration(), Duration::ZERO);
    }

    #[test]
    fn test_stage_index() {
        let schedule = schedule();
        assert_eq!(schedule.stage_index_at(Duration::ZERO), Some(0));
        assert_eq!(schedule.stage_index_at(Duration::from_secs(12)), Some(1));
        assert_eq!(schedule.stage_index_at(Duration::from_secs(25)), None);
    }
}
