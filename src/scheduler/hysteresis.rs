//! Pass/fail hysteresis with re-arm.

use crate::store::{Service, ServiceRuntime};

/// State change produced by a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Crossed into Up. `announce` is false for the first Up after boot.
    Up { announce: bool },
    /// Crossed into Down.
    Down,
    /// Still Down after `rearm_count` more failures; alert again.
    Rearm,
}

/// Fold one check result into the runtime counters and return the edge, if any.
pub fn apply_check(
    service: &Service,
    rt: &mut ServiceRuntime,
    result: Result<(), String>,
    now_ms: u64,
) -> Option<Transition> {
    let passed = result.is_ok();
    match result {
        Ok(()) => {
            rt.consecutive_passes = rt.consecutive_passes.saturating_add(1);
            rt.consecutive_fails = 0;
            rt.failed_checks_since_alert = 0;
            rt.last_uptime = Some(now_ms);
            rt.last_error.clear();
        }
        Err(error) => {
            rt.consecutive_fails = rt.consecutive_fails.saturating_add(1);
            rt.consecutive_passes = 0;
            rt.last_error = error;
        }
    }

    if !rt.is_up && rt.consecutive_passes >= service.pass_threshold.max(1) {
        rt.is_up = true;
        let announce = rt.has_been_up;
        rt.has_been_up = true;
        return Some(Transition::Up { announce });
    }

    if rt.is_up && rt.consecutive_fails >= service.fail_threshold.max(1) {
        rt.is_up = false;
        rt.failed_checks_since_alert = 0;
        return Some(Transition::Down);
    }

    if !passed && !rt.is_up && service.rearm_count > 0 {
        rt.failed_checks_since_alert += 1;
        if rt.failed_checks_since_alert >= service.rearm_count {
            rt.failed_checks_since_alert = 0;
            return Some(Transition::Rearm);
        }
    }

    None
}

/// A valid push marks the service Up at once, bypassing `pass_threshold`.
pub fn mark_push_received(rt: &mut ServiceRuntime, now_ms: u64) -> Option<Transition> {
    rt.last_push = Some(now_ms);
    rt.last_uptime = Some(now_ms);
    rt.consecutive_passes = rt.consecutive_passes.saturating_add(1);
    rt.consecutive_fails = 0;
    rt.failed_checks_since_alert = 0;
    rt.last_error.clear();

    if rt.is_up {
        return None;
    }
    rt.is_up = true;
    let announce = rt.has_been_up;
    rt.has_been_up = true;
    Some(Transition::Up { announce })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CodeOrName, ServiceInput};

    fn service(fail: i64, pass: i64, rearm: i64) -> Service {
        ServiceInput {
            name: Some("nas".into()),
            kind: Some(CodeOrName::Name("ping".into())),
            host: Some("10.0.0.2".into()),
            fail_threshold: Some(fail),
            pass_threshold: Some(pass),
            rearm_count: Some(rearm),
            ..Default::default()
        }
        .into_service()
        .unwrap()
    }

    fn run(svc: &Service, rt: &mut ServiceRuntime, pattern: &str) -> Vec<Option<Transition>> {
        pattern
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let result = if c == 'P' { Ok(()) } else { Err("down".to_string()) };
                let edge = apply_check(svc, rt, result, i as u64 * 1000);
                assert_eq!(rt.consecutive_passes * rt.consecutive_fails, 0);
                edge
            })
            .collect()
    }

    #[test]
    fn test_threshold_hysteresis() {
        let svc = service(3, 2, 0);
        let mut rt = ServiceRuntime::default();
        // Seed: the first Up after boot is silent.
        assert_eq!(run(&svc, &mut rt, "PP"), vec![None, Some(Transition::Up { announce: false })]);

        let edges = run(&svc, &mut rt, "FFFPFFFPP");
        assert_eq!(
            edges,
            vec![
                None,
                None,
                Some(Transition::Down),
                None,
                None,
                None,
                None,
                None,
                Some(Transition::Up { announce: true }),
            ]
        );
        assert!(rt.is_up);
    }

    #[test]
    fn test_initial_up_is_suppressed() {
        let svc = service(1, 1, 0);
        let mut rt = ServiceRuntime::default();
        assert_eq!(apply_check(&svc, &mut rt, Ok(()), 0), Some(Transition::Up { announce: false }));
        assert!(rt.is_up);
        assert!(rt.has_been_up);
    }

    #[test]
    fn test_rearm_after_count() {
        let svc = service(3, 1, 5);
        let mut rt = ServiceRuntime::default();
        run(&svc, &mut rt, "P");
        assert_eq!(run(&svc, &mut rt, "FFF").last(), Some(&Some(Transition::Down)));

        let edges = run(&svc, &mut rt, "FFFFF");
        assert_eq!(edges[..4], [None, None, None, None]);
        assert_eq!(edges[4], Some(Transition::Rearm));
        assert_eq!(rt.failed_checks_since_alert, 0);

        // A pass resets the re-arm counter.
        run(&svc, &mut rt, "FF");
        assert_eq!(rt.failed_checks_since_alert, 2);
        run(&svc, &mut rt, "P");
        assert_eq!(rt.failed_checks_since_alert, 0);
    }

    #[test]
    fn test_no_rearm_when_disabled() {
        let svc = service(1, 1, 0);
        let mut rt = ServiceRuntime::default();
        run(&svc, &mut rt, "PF");
        assert!(run(&svc, &mut rt, "FFFFFFFFFF").iter().all(Option::is_none));
    }

    #[test]
    fn test_edges_only_at_threshold() {
        let svc = service(2, 3, 0);
        let mut rt = ServiceRuntime::default();
        for edge in run(&svc, &mut rt, "PPFPPFPFPFF") {
            assert_eq!(edge, None);
        }
        assert!(!rt.is_up);
        assert_eq!(run(&svc, &mut rt, "PPP")[2], Some(Transition::Up { announce: false }));
    }

    #[test]
    fn test_push_marks_up_immediately() {
        let svc = service(1, 5, 0);
        let mut rt = ServiceRuntime::default();
        assert_eq!(mark_push_received(&mut rt, 1_000), Some(Transition::Up { announce: false }));
        assert_eq!(rt.last_push, Some(1_000));
        assert_eq!(mark_push_received(&mut rt, 2_000), None);

        assert_eq!(apply_check(&svc, &mut rt, Err("no push".into()), 70_000), Some(Transition::Down));
        assert_eq!(mark_push_received(&mut rt, 71_000), Some(Transition::Up { announce: true }));
    }
}
